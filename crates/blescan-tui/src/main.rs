//! Blescan TUI - 交互式终端界面
//!
//! 使用 ratatui 提供实时设备扫描和连接界面。
//!
//! # 日志
//!
//! 日志默认显示在 TUI 的"日志"标签页中。
//! 如需输出到文件进行调试，设置 RUST_LOG 环境变量：
//!
//! ```bash
//! RUST_LOG=debug cargo run -p blescan-tui 2>> /tmp/blescan.log
//! ```

mod app;
mod tui_log;
mod ui;

use anyhow::{Context, Result};
use blescan_core::{
    BtleplugRadio, ConnectionDirectory, Radio, ScanResultStore, ScanSession, Settings,
    SimulatedRadio,
};
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::prelude::*;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use app::App;
use tui_log::TuiLogLayer;

#[derive(Parser)]
#[command(name = "blescan-tui", version, about = "BLE 设备扫描终端界面")]
struct Args {
    /// 使用模拟无线电（无需蓝牙硬件）
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load();

    // 在进入终端界面之前打开适配器，失败时错误可以正常显示
    let (radio, advertiser) = if args.simulate {
        let radio = Arc::new(SimulatedRadio::demo());
        let advertiser = radio.spawn_advertiser(Duration::from_millis(300));
        (radio as Arc<dyn Radio>, Some(advertiser))
    } else {
        let radio = BtleplugRadio::new()
            .await
            .context("无法打开蓝牙适配器 (可使用 --simulate 在无硬件时试用)")?;
        (Arc::new(radio) as Arc<dyn Radio>, None)
    };

    let scan = Arc::new(ScanSession::new(Arc::clone(&radio), ScanResultStore::new()));
    let directory = Arc::new(ConnectionDirectory::new(radio, settings.session_config()));
    let mut app = App::new(scan, directory, settings);

    // 初始化日志系统，发送到 TUI 日志面板
    init_logging(app.event_tx.clone());

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    app.shutdown().await;
    if let Some(advertiser) = advertiser {
        advertiser.abort();
    }

    res
}

/// 初始化日志系统
///
/// - 总是将日志发送到 TUI 日志面板
/// - 如果设置了 RUST_LOG，同时输出到 stderr（用于调试）
fn init_logging(log_tx: tokio::sync::mpsc::Sender<app::AppEvent>) {
    // 桥接 log crate（blescan-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let tui_layer = TuiLogLayer::new(log_tx);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,blescan_core=debug"));

    if std::env::var("RUST_LOG").is_ok() {
        use tracing_subscriber::fmt;

        let stderr_layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(true)
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tui_layer)
            .with(stderr_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tui_layer)
            .try_init();
    }
}

async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        // 使用 poll 避免无限阻塞，同时让后台任务推进
        if event::poll(Duration::from_millis(0))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => {
                    return Ok(());
                }
                KeyCode::Char('s') => app.toggle_scan(),
                KeyCode::Char('c') => app.clear_results(),
                KeyCode::Char('x') => app.disconnect(),
                KeyCode::Char('d') => app.toggle_log_level(),
                KeyCode::Up | KeyCode::Char('k') => app.previous_device(),
                KeyCode::Down | KeyCode::Char('j') => app.next_device(),
                KeyCode::Enter => app.connect_selected(),
                KeyCode::Tab => app.next_tab(),
                KeyCode::Char('1') => app.tab = app::Tab::Devices,
                KeyCode::Char('2') => app.tab = app::Tab::Connection,
                KeyCode::Char('3') => app.tab = app::Tab::Log,
                _ => {}
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        app.tick();
    }
}
