//! Embroidery Buddy USB Daemon（常驻服务 + 维护命令）
//!
//! - `serve`（默认）：准备镜像、配置 USB gadget，直到收到 SIGINT/SIGTERM；
//! - `generate-config` / `create-image`：初始化部署；
//! - `put` / `get` / `clear` / `bench`：离线维护镜像（使用模拟链路，不触碰 gadget）；
//! - `mac`：查看用作 USB 序列号的 WiFi MAC。

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use embroidery_core::device_link::SimulatedLink;
use embroidery_core::system::{self, MacFormat};
use embroidery_core::{
    create_disk_image, new_device_link, Config, DiskCoordinator, DiskError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "embroidery-usbd")]
#[command(version)]
#[command(about = "Embroidery Buddy USB mass storage daemon", long_about = None)]
struct Cli {
    /// 配置文件路径；不指定时使用开发环境默认值（/tmp 镜像 + 模拟链路）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行服务（默认）
    Serve,
    /// 生成默认配置文件
    GenerateConfig(GenerateConfigArgs),
    /// 创建并格式化磁盘镜像
    CreateImage(CreateImageArgs),
    /// 把本地文件写入镜像
    Put(PutArgs),
    /// 从镜像读出文件
    Get(GetArgs),
    /// 清空镜像
    Clear,
    /// 写入速度测试
    Bench(BenchArgs),
    /// 显示 WiFi MAC 地址
    Mac(MacArgs),
}

#[derive(Args, Debug)]
struct GenerateConfigArgs {
    /// 输出路径
    #[arg(default_value = "config.json")]
    path: PathBuf,
}

#[derive(Args, Debug)]
struct CreateImageArgs {
    /// 镜像路径（默认取配置）
    #[arg(long)]
    path: Option<PathBuf>,

    /// 大小（MB，默认取配置）
    #[arg(long = "size-mb")]
    size_mb: Option<u64>,
}

#[derive(Args, Debug)]
struct PutArgs {
    /// 本地文件
    local: PathBuf,
    /// 镜像内路径
    dest: String,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// 镜像内路径
    path: String,

    /// 输出文件；不指定则写到 stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// 源文件
    #[arg(long)]
    source: PathBuf,

    /// 镜像内目标路径
    #[arg(long, default_value = "/test.bin")]
    dest: String,

    #[arg(long, default_value_t = 3)]
    iterations: u32,
}

#[derive(Args, Debug)]
struct MacArgs {
    /// 指定网卡（例如 wlan0）
    #[arg(long)]
    interface: Option<String>,

    /// 列出所有网卡
    #[arg(long, default_value_t = false)]
    all: bool,

    /// 输出格式：colon / hyphen / none / usb
    #[arg(long, default_value = "colon")]
    format: MacFormat,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let res = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => daemon_main(cli.config.as_deref()).await,
        Commands::GenerateConfig(args) => generate_config(&args),
        Commands::CreateImage(args) => {
            load_config(cli.config.as_deref()).and_then(|cfg| create_image(&cfg, &args))
        }
        Commands::Put(args) => load_config(cli.config.as_deref()).and_then(|cfg| put(&cfg, &args)),
        Commands::Get(args) => load_config(cli.config.as_deref()).and_then(|cfg| get(&cfg, &args)),
        Commands::Clear => load_config(cli.config.as_deref()).and_then(|cfg| clear(&cfg)),
        Commands::Bench(args) => {
            load_config(cli.config.as_deref()).and_then(|cfg| bench(&cfg, &args))
        }
        Commands::Mac(args) => mac(&args),
    };
    if let Err(e) = res {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn describe(e: DiskError) -> String {
    match e.user_message() {
        Some(hint) => format!("{} ({})", e, hint),
        None => e.to_string(),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, String> {
    match path {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            Config::load(path).map_err(|e| format!("Failed to load config: {}", e))
        }
        None => {
            info!("no config file specified, using development defaults");
            Ok(Config::development())
        }
    }
}

async fn daemon_main(config_path: Option<&Path>) -> Result<(), String> {
    println!("Embroidery Buddy USB Daemon v{}", env!("CARGO_PKG_VERSION"));
    println!("Initializing...");

    let cfg = load_config(config_path)?;
    println!("  ✓ Configuration loaded");

    if cfg
        .disk
        .ensure_image()
        .map_err(|e| format!("Failed to prepare disk image: {}", e))?
    {
        println!("  ✓ Disk image created");
    }

    let serial = system::usb_serial_number(Path::new(system::DEFAULT_NET_ROOT));
    let descriptor = cfg
        .gadget_descriptor(&serial)
        .map_err(|e| format!("Invalid USB gadget configuration: {}", e))?;
    let link = new_device_link(descriptor, cfg.usb_gadget.simulated);
    println!(
        "  ✓ Device link: {}",
        if cfg.usb_gadget.simulated {
            "simulated"
        } else {
            "configfs"
        }
    );

    let coordinator = DiskCoordinator::new(&cfg.disk, link)
        .map_err(|e| format!("Failed to initialize disk coordinator: {}", describe(e)))?;
    println!("  ✓ Disk coordinator initialized ({})", cfg.disk.path.display());
    println!("Ready. Press Ctrl+C to stop.\n");

    wait_for_shutdown().await?;

    println!("\nShutting down...");
    coordinator.close();
    println!("✓ USB gadget removed");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<(), String> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())
        .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.map_err(|e| format!("Failed to wait for Ctrl+C: {}", e))
        }
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<(), String> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to wait for Ctrl+C: {}", e))
}

fn generate_config(args: &GenerateConfigArgs) -> Result<(), String> {
    Config::default()
        .save(&args.path)
        .map_err(|e| format!("Failed to generate config: {}", e))?;
    println!("Configuration file generated: {}", args.path.display());
    Ok(())
}

fn create_image(cfg: &Config, args: &CreateImageArgs) -> Result<(), String> {
    let path = args.path.clone().unwrap_or_else(|| cfg.disk.path.clone());
    let size_mb = args.size_mb.unwrap_or(cfg.disk.size_mb);
    create_disk_image(&path, size_mb)
        .map_err(|e| format!("Failed to create disk image: {}", e))?;
    println!("Disk image created: {} ({}MB)", path.display(), size_mb);
    Ok(())
}

/// 离线协调器：镜像必须已存在，链路为模拟实现，不触碰 gadget
fn offline_coordinator(cfg: &Config) -> Result<DiskCoordinator, String> {
    DiskCoordinator::new(&cfg.disk, Box::new(SimulatedLink::new()))
        .map_err(|e| format!("Failed to open disk: {}", describe(e)))
}

fn put(cfg: &Config, args: &PutArgs) -> Result<(), String> {
    let coordinator = offline_coordinator(cfg)?;
    let file = fs::File::open(&args.local)
        .map_err(|e| format!("Failed to open {}: {}", args.local.display(), e))?;
    let size = file
        .metadata()
        .map_err(|e| format!("Failed to stat {}: {}", args.local.display(), e))?
        .len();

    coordinator
        .begin_transaction(|tx| tx.write_file(&args.dest, &file, size))
        .map_err(|e| format!("Failed to write {}: {}", args.dest, describe(e)))?;
    println!("Wrote {} ({} bytes)", args.dest, size);
    Ok(())
}

fn get(cfg: &Config, args: &GetArgs) -> Result<(), String> {
    let coordinator = offline_coordinator(cfg)?;
    let contents = coordinator
        .read_file(&args.path)
        .map_err(|e| format!("Failed to read {}: {}", args.path, describe(e)))?
        .into_bytes();

    match &args.output {
        Some(out) => {
            fs::write(out, &contents)
                .map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;
            println!("Read {} ({} bytes) -> {}", args.path, contents.len(), out.display());
        }
        None => {
            std::io::stdout()
                .write_all(&contents)
                .map_err(|e| format!("Failed to write stdout: {}", e))?;
        }
    }
    Ok(())
}

fn clear(cfg: &Config) -> Result<(), String> {
    let coordinator = offline_coordinator(cfg)?;
    coordinator
        .clear_files()
        .map_err(|e| format!("Failed to clear disk: {}", describe(e)))?;
    println!("Disk cleared: {}", cfg.disk.path.display());
    Ok(())
}

fn mb_per_sec(bytes: u64, d: Duration) -> f64 {
    bytes as f64 / d.as_secs_f64().max(f64::EPSILON) / 1024.0 / 1024.0
}

fn bench(cfg: &Config, args: &BenchArgs) -> Result<(), String> {
    let size = fs::metadata(&args.source)
        .map_err(|e| format!("Source file not found: {}: {}", args.source.display(), e))?
        .len();
    let coordinator = offline_coordinator(cfg)?;

    println!("Benchmark Configuration:");
    println!("  Image: {}", cfg.disk.path.display());
    println!("  Writer: {}", cfg.disk.writer);
    println!(
        "  Source: {} ({} bytes / {:.2} MB)",
        args.source.display(),
        size,
        size as f64 / 1024.0 / 1024.0
    );
    println!("  Destination: {}", args.dest);
    println!("  Iterations: {}\n", args.iterations);

    let mut durations = Vec::new();
    for i in 0..args.iterations {
        println!("Iteration {}/{}...", i + 1, args.iterations);
        let file = match fs::File::open(&args.source) {
            Ok(f) => f,
            Err(e) => {
                println!("  Error: {}", e);
                continue;
            }
        };

        let start = Instant::now();
        let res = coordinator.begin_transaction(|tx| tx.write_file(&args.dest, &file, size));
        let elapsed = start.elapsed();
        if let Err(e) = res {
            println!("  Error: {}", describe(e));
            continue;
        }
        println!("  Duration: {:?}", elapsed);
        println!("  Throughput: {:.2} MB/s", mb_per_sec(size, elapsed));
        durations.push(elapsed);
    }

    let (Some(min), Some(max)) = (durations.iter().min(), durations.iter().max()) else {
        return Err("All iterations failed!".to_string());
    };
    let avg = durations.iter().sum::<Duration>() / durations.len() as u32;

    println!("\n=== Results ===");
    println!("Successful iterations: {}/{}", durations.len(), args.iterations);
    println!("Min duration:  {:?} ({:.2} MB/s)", min, mb_per_sec(size, *min));
    println!("Max duration:  {:?} ({:.2} MB/s)", max, mb_per_sec(size, *max));
    println!("Avg duration:  {:?} ({:.2} MB/s)", avg, mb_per_sec(size, avg));
    Ok(())
}

fn mac(args: &MacArgs) -> Result<(), String> {
    let net_root = Path::new(system::DEFAULT_NET_ROOT);

    if args.all {
        let macs = system::list_mac_addresses(net_root)
            .map_err(|e| format!("Failed to get MAC addresses: {}", e))?;
        println!("Network Interfaces:");
        for (iface, mac) in macs {
            println!("  {:<15} {}", format!("{}:", iface), system::format_mac(&mac, args.format));
        }
        return Ok(());
    }

    if let Some(iface) = &args.interface {
        let mac = system::mac_address(net_root, iface)
            .ok_or_else(|| format!("No MAC address found for interface {}", iface))?;
        println!("{}", system::format_mac(&mac, args.format));
        return Ok(());
    }

    match system::find_wifi_interface(net_root) {
        Some((name, mac)) => {
            println!("WiFi interface: {}", name);
            println!("MAC address: {}", system::format_mac(&mac, args.format));
            Ok(())
        }
        None => {
            warn!("no WiFi interface found");
            if let Ok(macs) = system::list_mac_addresses(net_root) {
                eprintln!("No WiFi interface found. Available interfaces:");
                for iface in macs.keys() {
                    eprintln!("  - {}", iface);
                }
                eprintln!("\nUse --interface <name> to specify an interface");
            }
            Err("no WiFi interface found".to_string())
        }
    }
}
