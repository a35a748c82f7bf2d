//! UI rendering module

use blescan_core::{AdvertisementRecord, ConnectionState};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, Paragraph, Tabs, Wrap},
};

use crate::app::{App, AppMode, ConnectionView, Tab};

pub fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(10),   // Main content
            Constraint::Length(3), // Status bar
        ])
        .split(frame.area());

    draw_header(frame, app, chunks[0]);
    draw_main(frame, app, chunks[1]);
    draw_status_bar(frame, app, chunks[2]);
}

fn draw_header(frame: &mut Frame, app: &App, area: Rect) {
    let titles = vec!["设备 [1]", "连接 [2]", "日志 [3]"];
    let selected = match app.tab {
        Tab::Devices => 0,
        Tab::Connection => 1,
        Tab::Log => 2,
    };

    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::ALL).title(" Blescan TUI "))
        .select(selected)
        .style(Style::default().fg(Color::White))
        .highlight_style(Style::default().fg(Color::Yellow).bold());

    frame.render_widget(tabs, area);
}

fn draw_main(frame: &mut Frame, app: &App, area: Rect) {
    match app.tab {
        Tab::Devices => draw_devices_tab(frame, app, area),
        Tab::Connection => draw_connection_tab(frame, app, area),
        Tab::Log => draw_log_tab(frame, app, area),
    }
}

fn draw_devices_tab(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    let items: Vec<ListItem> = app
        .devices
        .iter()
        .enumerate()
        .map(|(i, dev)| {
            let rssi = dev.rssi.unwrap_or(i16::MIN);
            let content = format!(
                "{:<20} {} {} {:>4}",
                dev.display_name(),
                dev.address,
                rssi_to_bar(rssi),
                dev.rssi.map_or_else(|| "--".to_string(), |r| r.to_string())
            );
            let style = if i == app.selected_device {
                Style::default().bg(Color::DarkGray).fg(Color::White)
            } else if dev.name.is_none() {
                Style::default().fg(Color::Gray)
            } else {
                Style::default()
            };
            ListItem::new(content).style(style)
        })
        .collect();

    let title = match app.mode {
        AppMode::Scanning => format!(" 🔍 扫描中... ({}) ", app.devices.len()),
        _ => format!(" 📱 附近设备 ({}) ", app.devices.len()),
    };

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD));

    frame.render_widget(list, chunks[0]);

    let detail = match app.selected() {
        Some(device) => device_details(device),
        None if app.scan_status.is_scanning() => "等待广播...".to_string(),
        None => "按 's' 开始扫描\n按 'q' 退出".to_string(),
    };

    let help = Paragraph::new(detail)
        .block(Block::default().borders(Borders::ALL).title(" 详情 "))
        .wrap(Wrap { trim: true });

    frame.render_widget(help, chunks[1]);
}

fn device_details(device: &AdvertisementRecord) -> String {
    let mut lines = vec![
        format!("名称: {}", device.display_name()),
        format!("地址: {}", device.address),
        format!(
            "RSSI: {}",
            device
                .rssi
                .map_or_else(|| "--".to_string(), |r| format!("{} dBm", r))
        ),
    ];
    if let Some(tx_power) = device.payload.tx_power {
        lines.push(format!("发射功率: {} dBm", tx_power));
    }
    if !device.payload.services.is_empty() {
        lines.push("服务:".to_string());
        lines.extend(device.payload.services.iter().map(|s| format!("  {}", s)));
    }
    if !device.payload.manufacturer_data.is_empty() {
        let mut ids: Vec<_> = device.payload.manufacturer_data.keys().collect();
        ids.sort();
        lines.push(format!(
            "厂商数据: {}",
            ids.iter()
                .map(|id| format!("0x{:04X}", id))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    lines.push(String::new());
    lines.push("Enter 连接并读取\n↑/↓ 选择设备\n'c' 清空列表".to_string());
    lines.join("\n")
}

fn draw_connection_tab(frame: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // State
            Constraint::Min(5),    // Value
        ])
        .split(area);

    let Some(view) = &app.connection else {
        let empty = Paragraph::new("未连接设备\n在设备列表中按 Enter 连接")
            .block(Block::default().borders(Borders::ALL).title(" 🔗 连接 "));
        frame.render_widget(empty, area);
        return;
    };

    let state = Paragraph::new(vec![
        Line::from(format!("设备: {}", view.address)),
        Line::from(vec![
            Span::raw("状态: "),
            Span::styled(view.state.to_string(), state_style(view.state)),
        ]),
        Line::from(format!("服务: {}", view.services)),
    ])
    .block(Block::default().borders(Borders::ALL).title(" 🔗 连接 "));

    frame.render_widget(state, chunks[0]);

    let value = Paragraph::new(value_text(view, app))
        .block(Block::default().borders(Borders::ALL).title(" 📖 特征值 "))
        .wrap(Wrap { trim: false });

    frame.render_widget(value, chunks[1]);
}

fn value_text(view: &ConnectionView, app: &App) -> String {
    let header = format!(
        "{} / {}",
        app.settings.read_service, app.settings.read_characteristic
    );
    match (&view.value, &view.error) {
        (_, Some(error)) => format!("{}\n\n❌ {}", header, error),
        (Some(value), None) => format!(
            "{}\n\nHEX:  {}\nTEXT: {}\n\n按 'x' 断开",
            header,
            value
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" "),
            String::from_utf8_lossy(value)
        ),
        (None, None) => format!("{}\n\n等待读取...", header),
    }
}

fn state_style(state: ConnectionState) -> Style {
    match state {
        ConnectionState::Ready => Style::default().fg(Color::Green).bold(),
        ConnectionState::Failed(_) => Style::default().fg(Color::Red).bold(),
        ConnectionState::Disconnected => Style::default().fg(Color::Gray),
        _ => Style::default().fg(Color::Yellow),
    }
}

fn draw_log_tab(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let items: Vec<ListItem> = app
        .visible_logs()
        .rev()
        .take(height.max(1))
        .map(|entry| {
            let style = match entry.level {
                blescan_core::LogLevel::Error => Style::default().fg(Color::Red),
                blescan_core::LogLevel::Warn => Style::default().fg(Color::Yellow),
                blescan_core::LogLevel::Info => Style::default(),
                _ => Style::default().fg(Color::DarkGray),
            };
            ListItem::new(entry.to_string()).style(style)
        })
        .collect();

    let title = format!(" 📋 日志 ({}) [d]切换级别 ", app.log_level);
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title(title));

    frame.render_widget(list, area);
}

fn draw_status_bar(frame: &mut Frame, app: &App, area: Rect) {
    let mode_text = match app.mode {
        AppMode::Idle => " ⏸️  空闲 ",
        AppMode::Scanning => " 🔍 扫描中 ",
        AppMode::Connecting => " 🔗 连接中 ",
    };

    let status = Paragraph::new(format!(
        "{}│ 设备: {} │ {} │ [s]扫描 [c]清空 [Enter]读取 [x]断开 [Tab]切换 [q]退出",
        mode_text,
        app.devices.len(),
        app.status_message
    ))
    .block(Block::default().borders(Borders::ALL));

    frame.render_widget(status, area);
}

fn rssi_to_bar(rssi: i16) -> &'static str {
    if rssi > -50 {
        "████"
    } else if rssi > -60 {
        "███░"
    } else if rssi > -70 {
        "██░░"
    } else if rssi > -80 {
        "█░░░"
    } else {
        "░░░░"
    }
}
