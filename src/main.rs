use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use routegate::config::Config;
use routegate::handoff;
use routegate::mux::Mux;
use routegate::stapler::{MemoryStapler, Stapler};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routegate=info".parse().expect("valid log directive")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "configuration loaded");
            config
        }
        None => {
            warn!("no configuration file given, starting with defaults");
            Config::default()
        }
    };

    // Write PID file if configured (with exclusive lock)
    let _pid_file = match config.proxy.pid_file.as_deref() {
        Some(path) => {
            let pid_file = write_pid_file(Path::new(path))?;
            info!(path, "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    let stapler: Arc<dyn Stapler> = MemoryStapler::new();
    let mux = Arc::new(Mux::new(
        std::process::id() as usize,
        stapler,
        config.proxy.to_mux_options(),
    )?);

    mux.init(config.snapshot())?;

    // A parent upgrading in place passes its bound sockets through the
    // environment; adopt them before binding anything fresh.
    let inherited = handoff::files_from_env()?;
    if !inherited.is_empty() {
        info!(count = inherited.len(), "inheriting listener sockets from parent");
        mux.take_files(inherited)?;
        std::env::remove_var(handoff::FILES_ENV);
    }

    mux.start()?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr2 = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("got SIGTERM, shutting down gracefully");
                mux.stop(true).await;
                break;
            }
            _ = sigint.recv() => {
                info!("got SIGINT, shutting down gracefully");
                mux.stop(true).await;
                break;
            }
            _ = sigusr2.recv() => {
                info!("got SIGUSR2, forking successor");
                if let Err(e) = start_successor(&mux) {
                    error!(error = %e, "failed to start successor");
                }
            }
        }
    }

    info!("exited gracefully");
    Ok(())
}

/// Fork a successor process that inherits every listening socket, so
/// the endpoints never unbind during the upgrade.
fn start_successor(mux: &Arc<Mux>) -> anyhow::Result<()> {
    let files = mux.get_files()?;
    let payload = handoff::files_to_string(&files)?;
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    info!(files = %payload, "passing listener sockets to successor");

    let raw_fds: Vec<i32> = files.iter().map(|f| f.raw_fd()).collect();
    let mut cmd = std::process::Command::new(exe);
    cmd.args(&args).env(handoff::FILES_ENV, payload);
    unsafe {
        use std::os::unix::process::CommandExt;
        cmd.pre_exec(move || {
            // Stage every descriptor above the target range first, then
            // land them at 3 onward. dup2 clears close-on-exec.
            let mut staged = Vec::with_capacity(raw_fds.len());
            for &fd in &raw_fds {
                let tmp = unsafe { libc::fcntl(fd, libc::F_DUPFD, 100) };
                if tmp < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                staged.push(tmp);
            }
            for (i, &tmp) in staged.iter().enumerate() {
                if unsafe { libc::dup2(tmp, i as i32 + 3) } < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    info!(pid = child.id(), "successor started");
    // The duplicated descriptors stay open in this process until the
    // files drop here, after the child already inherited them.
    drop(files);
    Ok(())
}

/// Write our PID and hold an exclusive lock so two instances cannot
/// share a PID file.
fn write_pid_file(path: &Path) -> anyhow::Result<File> {
    let mut file = File::create(path)?;

    let fd = file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "PID file {} is locked by another instance",
            path.display()
        );
    }

    write!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(file)
}
