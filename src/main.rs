use clap::Parser;
use mirrorfs::PassthroughFs;
use mirrorfs::fuse::mount::{mount_privileged, mount_unprivileged};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Pass-through FUSE filesystem mirroring a host directory")]
struct Args {
    /// Path to mount point (must be an empty directory)
    #[arg(long)]
    mountpoint: String,
    /// Source directory to expose
    #[arg(long)]
    rootdir: String,
    /// Use a privileged mount syscall instead of fusermount3
    #[arg(long, default_value_t = false)]
    privileged: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let root = std::fs::canonicalize(&args.rootdir).unwrap_or_else(|e| {
        eprintln!("invalid root directory {}: {e}", args.rootdir);
        std::process::exit(2);
    });
    let fs = PassthroughFs::new(root);

    let mut mount_handle = if args.privileged {
        mount_privileged(fs, &args.mountpoint).await
    } else {
        mount_unprivileged(fs, &args.mountpoint).await
    }
    .unwrap_or_else(|e| {
        eprintln!("mount failed: {e}");
        std::process::exit(1);
    });

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => {
            if let Err(e) = res {
                eprintln!("fuse session ended: {e}");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            if let Err(e) = mount_handle.unmount().await {
                eprintln!("unmount failed: {e}");
            }
        }
    }
}
