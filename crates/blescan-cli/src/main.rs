//! Blescan CLI
//!
//! 命令行客户端，扫描附近 BLE 设备并读取 GATT 特征

mod backend;

use anyhow::{Result, bail};
use backend::Backend;
use blescan_core::ble::advertisement::normalize_address;
use blescan_core::{
    AdvertisementRecord, ConnectionDirectory, ScanFilter, ScanResultStore, ScanSession, Settings,
};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blescan", version, about = "BLE 设备扫描与 GATT 读取工具")]
struct Cli {
    /// 详细日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近设备
    Scan {
        /// 扫描时长 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// 只保留该名称的设备
        #[arg(short, long)]
        name: Option<String>,
        /// 只保留广播了该服务的设备
        #[arg(short, long)]
        service: Option<Uuid>,
        /// 以 JSON 输出结果
        #[arg(long)]
        json: bool,
        /// 使用模拟无线电
        #[arg(long)]
        simulate: bool,
    },
    /// 连接设备并读取特征值
    Read {
        /// 设备地址
        address: String,
        /// 服务 UUID (默认: Device Information)
        #[arg(short, long)]
        service: Option<Uuid>,
        /// 特征 UUID (默认: Model Number String)
        #[arg(short, long)]
        characteristic: Option<Uuid>,
        /// 查找设备的超时时间 (秒)
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// 使用模拟无线电
        #[arg(long)]
        simulate: bool,
    },
    /// 查看当前设置
    Settings {
        /// 将当前设置写入配置文件
        #[arg(long)]
        save: bool,
    },
}

fn init_logging(verbose: bool) {
    // 桥接 log crate（blescan-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if verbose {
        "debug,blescan_core=trace"
    } else {
        "info,blescan_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load();
    init_logging(cli.verbose || settings.verbose);

    match cli.command {
        Commands::Scan {
            timeout,
            name,
            service,
            json,
            simulate,
        } => scan(&settings, timeout, name, service, json, simulate).await,
        Commands::Read {
            address,
            service,
            characteristic,
            timeout,
            simulate,
        } => {
            read(
                &settings,
                &address,
                service.unwrap_or(settings.read_service),
                characteristic.unwrap_or(settings.read_characteristic),
                timeout,
                simulate,
            )
            .await
        }
        Commands::Settings { save } => {
            println!("⚙️  配置文件: {}", Settings::config_path().display());
            println!();
            print!("{}", toml::to_string_pretty(&settings)?);
            if save {
                settings.save()?;
                println!();
                println!("✅ 已保存");
            }
            Ok(())
        }
    }
}

async fn scan(
    settings: &Settings,
    timeout: u64,
    name: Option<String>,
    service: Option<Uuid>,
    json: bool,
    simulate: bool,
) -> Result<()> {
    // 命令行条件优先于配置文件中的过滤条件
    let filters = if name.is_some() || service.is_some() {
        Some(vec![ScanFilter {
            name,
            address: None,
            service,
        }])
    } else {
        settings.scan_filters()
    };

    let backend = Backend::open(simulate).await?;
    let session = ScanSession::new(backend.radio.clone(), ScanResultStore::new());

    if !json {
        println!("🔍 扫描设备 ({}s)...", timeout);
    }
    session.start(filters, settings.scan).await?;

    let mut status = session.subscribe();
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(timeout)) => {}
        _ = tokio::signal::ctrl_c() => {}
        _ = status.wait_for(|s| !s.is_scanning()) => {}
    }
    session.stop().await;

    let devices = session.store().snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("   未发现设备");
    } else {
        for (i, device) in devices.iter().enumerate() {
            println!("   {}", format_device(i, device));
        }
    }

    if let Some(failure) = session.status().failure {
        eprintln!("⚠️  扫描失败: {}", failure);
    }
    Ok(())
}

async fn read(
    settings: &Settings,
    address: &str,
    service: Uuid,
    characteristic: Uuid,
    timeout: u64,
    simulate: bool,
) -> Result<()> {
    let address = normalize_address(address);
    let backend = Backend::open(simulate).await?;

    // 1. 先扫描确认设备在范围内
    println!("🔍 查找设备 {} ...", address);
    let scan = ScanSession::new(backend.radio.clone(), ScanResultStore::new());
    scan.start(
        Some(vec![ScanFilter {
            address: Some(address.clone()),
            ..Default::default()
        }]),
        settings.scan,
    )
    .await?;

    let store = scan.store().clone();
    let mut revision = store.subscribe();
    let found = tokio::time::timeout(
        Duration::from_secs(timeout),
        revision.wait_for(|_| store.get(&address).is_some()),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    scan.stop().await;

    let Some(device) = store.get(&address).filter(|_| found) else {
        bail!("未找到设备 {} ({}s 内未收到广播)", address, timeout);
    };
    println!("   {}", format_device(0, &device));

    // 2. 连接并等待服务发现完成
    println!("🔗 连接中...");
    let directory = ConnectionDirectory::new(backend.radio.clone(), settings.session_config());
    let session = directory.connect(&address).await?;
    let services = match session.wait_ready().await {
        Ok(services) => services,
        Err(e) => {
            session.disconnect().await;
            return Err(e.into());
        }
    };
    println!("✅ 已就绪 ({} 个服务)", services.len());

    // 3. 读取特征后断开
    let result = session.read_characteristic(service, characteristic).await;
    session.disconnect().await;
    let value = result?;

    println!("📖 {} / {}", service, characteristic);
    println!("   HEX:  {}", format_hex(&value));
    println!("   TEXT: {}", String::from_utf8_lossy(&value));
    Ok(())
}

fn format_device(index: usize, device: &AdvertisementRecord) -> String {
    let rssi = device
        .rssi
        .map_or_else(|| "--".to_string(), |rssi| format!("{} dBm", rssi));
    format!(
        "[{}] {} ({}) {}",
        index,
        device.display_name(),
        device.address,
        rssi
    )
}

fn format_hex(value: &[u8]) -> String {
    value
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_device() {
        let device = AdvertisementRecord::new("c4:7c:8d:6a:10:89", None).with_rssi(-48);
        assert_eq!(
            format_device(2, &device),
            "[2] Unnamed (C4:7C:8D:6A:10:89) -48 dBm"
        );

        let device = AdvertisementRecord::new("AA:01", Some("MS1089".into()));
        assert_eq!(format_device(0, &device), "[0] MS1089 (AA:01) --");
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(b"MS"), "4D 53");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_cli_parses_read() {
        let cli = Cli::parse_from([
            "blescan",
            "read",
            "aa:bb:cc:dd:ee:ff",
            "--characteristic",
            "00002a24-0000-1000-8000-00805f9b34fb",
            "--simulate",
        ]);
        let Commands::Read {
            address,
            characteristic,
            simulate,
            ..
        } = cli.command
        else {
            panic!("expected read command");
        };
        assert_eq!(address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(characteristic, Some(blescan_core::MODEL_NUMBER_CHARACTERISTIC));
        assert!(simulate);
    }
}
