use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use tokio::{net::TcpStream, sync::watch, task::JoinSet};

use crate::rtunnel::{
    config, logging,
    tunnel::{
        ReverseTunnel, TunnelConfig, TunnelError, cancelled,
        identity::StaticIdentity,
        session::{BoxedStream, Signer, keys},
        transport,
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;
    install_crypto_provider();

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        endpoint = %transport::redacted(&cfg.endpoint),
        session_id = %cfg.session_id,
        forward_addr = %cfg.forward_addr,
        keepalive = %humantime::format_duration(cfg.keepalive),
        "rtunnel: starting"
    );

    let signers = load_signers(&cfg.key_files)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown: signal");
        let _ = shutdown_tx.send(true);
    });

    let mut tcfg = TunnelConfig::new(cfg.endpoint.clone(), cfg.session_id.clone(), signers);
    tcfg.keepalive_interval = cfg.keepalive;
    tcfg.span = tracing::info_span!(
        "tunnel",
        endpoint = %transport::redacted(&cfg.endpoint),
        session_id = %cfg.session_id
    );

    let mut tunnel = ReverseTunnel::new(tcfg);
    if let Some(name) = &cfg.identity {
        tunnel = tunnel.with_identity(Arc::new(StaticIdentity(name.clone())));
    }

    let res = serve(&mut tunnel, &cfg.forward_addr, shutdown_rx).await;
    tunnel.close().await;
    signals.abort();
    res
}

async fn serve(
    tunnel: &mut ReverseTunnel,
    forward_addr: &str,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    match tunnel.establish(shutdown.clone()).await {
        Ok(info) => {
            tracing::info!(server_info = %info, "rtunnel: connected");
        }
        Err(TunnelError::Cancelled { .. }) => return Ok(()),
        Err(err @ TunnelError::PermissionDenied(_)) => {
            return Err(err).context("relay rejected every configured key");
        }
        Err(err) => return Err(err.into()),
    }

    let listener = tunnel.listener().context("tunnel: no reverse listener")?;
    let stop = cancelled(shutdown);
    tokio::pin!(stop);

    let mut tasks = JoinSet::new();
    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break Ok(()),
            res = listener.accept() => match res {
                Ok(st) => {
                    tasks.spawn(bridge(st, forward_addr.to_string()));
                }
                Err(err) => {
                    tracing::warn!(err = %err, "tunnel: reverse listener closed");
                    break Err(anyhow::anyhow!("tunnel: reverse listener closed: {err}"));
                }
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    };

    listener.close().await;
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    outcome
}

async fn bridge(mut st: BoxedStream, forward_addr: String) {
    let mut up = match TcpStream::connect(&forward_addr).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(forward_addr = %forward_addr, err = %err, "tunnel: dial forward target failed");
            return;
        }
    };
    let _ = up.set_nodelay(true);

    match tokio::io::copy_bidirectional(&mut st, &mut up).await {
        Ok((from_relay, to_relay)) => {
            tracing::debug!(from_relay, to_relay, "tunnel: reverse connection done");
        }
        Err(err) => {
            tracing::debug!(err = %err, "tunnel: reverse connection ended with error");
        }
    }
}

fn load_signers(paths: &[PathBuf]) -> anyhow::Result<Vec<Arc<dyn Signer>>> {
    paths
        .iter()
        .map(|p| {
            let s = keys::Ed25519Signer::load(p)?;
            tracing::debug!(key_file = %p.display(), "tunnel: loaded key");
            Ok(Arc::new(s) as Arc<dyn Signer>)
        })
        .collect()
}

fn install_crypto_provider() {
    // Errors only when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Writes a fresh Ed25519 key and prints its public half.
pub fn keygen(out: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match out {
        Some(p) => p,
        None => config::default_key_path()?,
    };
    let der = keys::Ed25519Signer::generate_pkcs8().context("keygen: generate")?;
    let signer = keys::Ed25519Signer::from_pkcs8(&der).context("keygen: parse")?;
    write_key_file(&path, &keys::encode_pkcs8(&der))?;

    println!("{} {}", keys::ED25519, STANDARD.encode(signer.public_key()));
    eprintln!("wrote {}", path.display());
    Ok(())
}

fn write_key_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("keygen: mkdir {}", parent.display()))?;
    }

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut f = opts
        .open(path)
        .with_context(|| format!("keygen: create {}", path.display()))?;
    writeln!(f, "{contents}").with_context(|| format!("keygen: write {}", path.display()))?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use url::Url;

    use super::*;
    use crate::rtunnel::tunnel::session::testing::{RelayOptions, TestRelay};

    #[test]
    fn keygen_writes_loadable_key_once() {
        let dir = std::env::temp_dir().join(format!("rtunnel_keygen_test_{}", std::process::id()));
        let path = dir.join("id_ed25519");
        let _ = std::fs::remove_dir_all(&dir);

        keygen(Some(path.clone())).expect("keygen");
        let signer = keys::Ed25519Signer::load(&path).expect("load");
        assert_eq!(signer.public_key().len(), 32);

        assert!(keygen(Some(path.clone())).is_err(), "must not overwrite");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn serve_bridges_reverse_channels_to_forward_addr() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let forward_addr = echo.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let signer: Arc<dyn Signer> = Arc::new(keys::Ed25519Signer::generate().unwrap());
        let relay = TestRelay::new(RelayOptions::authorizing(vec![signer.public_key()]));
        let addr = relay.serve_tcp().await;
        let cfg = TunnelConfig::new(
            Url::parse(&format!("ssh://{addr}")).unwrap(),
            "sess-1",
            vec![signer],
        );
        let mut tunnel =
            ReverseTunnel::new(cfg).with_identity(Arc::new(StaticIdentity("alice".into())));

        let (tx, rx) = watch::channel(false);
        let client = async {
            while !relay.is_bound("sess-1").await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let mut ch = relay.open_channel("sess-1").await;
            ch.write_all(b"marco").await.unwrap();
            let mut buf = [0u8; 5];
            ch.read_exact(&mut buf).await.unwrap();
            tx.send(true).unwrap();
            buf
        };

        let (res, echoed) = tokio::join!(serve(&mut tunnel, &forward_addr, rx), client);
        res.expect("serve");
        assert_eq!(&echoed, b"marco");
        tunnel.close().await;
    }
}
