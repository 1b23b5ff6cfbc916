use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use troupe::prelude::*;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub volley: u32,
}
impl_command!(Ping, "ping-pong::Ping");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub volley: u32,
}
impl_command!(Pong, "ping-pong::Pong");

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Read from `TROUPE_HOST`, `TROUPE_PORT`, `TROUPE_KEY_BITS`,
/// `TROUPE_SECURE`, and `TROUPE_VOLLEYS`.
#[derive(Debug, Clone)]
struct Settings {
    host: String,
    port: u16,
    key_bits: usize,
    secure: bool,
    volleys: u32,
}

impl Settings {
    fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        Self {
            host: var("TROUPE_HOST", "127.0.0.1".to_string()),
            port: var("TROUPE_PORT", 9000),
            key_bits: var("TROUPE_KEY_BITS", SecureConfig::default().key_bits),
            secure: var("TROUPE_SECURE", false),
            volleys: var("TROUPE_VOLLEYS", 5),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn secure_config(&self) -> SecureConfig {
        SecureConfig {
            key_bits: self.key_bits,
            ..SecureConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

fn theater() -> Theater {
    Theater::new().with_actor(|client: &ClientId, ping: Ping| {
        tracing::info!(%client, volley = ping.volley, "ping");
        Some(Pong {
            volley: ping.volley,
        })
    })
}

/// A running server of either kind.
enum Running {
    Plain(ServerHandle),
    Secure(SecureServerHandle),
}

impl Running {
    fn stop(&self) {
        match self {
            Running::Plain(handle) => handle.stop(),
            Running::Secure(handle) => handle.stop(),
        }
    }
}

/// Binds the server and returns its handle and the address it listens on.
async fn serve(settings: &Settings) -> Result<(Running, String), TroupeError> {
    if settings.secure {
        let server = theater()
            .bind_secure(&settings.addr(), ServerConfig::default(), settings.secure_config())
            .await?;
        let addr = server.local_addr()?.to_string();
        let handle = Running::Secure(server.handle());
        tokio::spawn(server.run());
        Ok((handle, addr))
    } else {
        let server = theater().bind(&settings.addr()).await?;
        let addr = server.local_addr()?.to_string();
        let handle = Running::Plain(server.handle());
        tokio::spawn(server.run());
        Ok((handle, addr))
    }
}

/// Plays `volleys` rounds against the server at `addr`; returns the last
/// volley number seen.
async fn play(settings: &Settings, addr: &str) -> Result<u32, TroupeError> {
    if settings.secure {
        let puppeteer = Puppeteer::connect_secure(addr, settings.secure_config()).await?;
        rally(&puppeteer, settings.volleys).await
    } else {
        let puppeteer = Puppeteer::connect(addr).await?;
        rally(&puppeteer, settings.volleys).await
    }
}

async fn rally<C: ClientChannel>(puppeteer: &Puppeteer<C>, volleys: u32) -> Result<u32, TroupeError> {
    let (done_tx, mut done) = mpsc::unbounded_channel();
    puppeteer.register_dispatcher(move |pong: Pong| {
        tracing::info!(volley = pong.volley, "pong");
        if pong.volley + 1 >= volleys {
            let _ = done_tx.send(pong.volley);
            None
        } else {
            Some(Ping {
                volley: pong.volley + 1,
            })
        }
    });

    puppeteer.give_command(&Ping { volley: 0 }).await?;
    let last = tokio::time::timeout(Duration::from_secs(30), done.recv())
        .await
        .ok()
        .flatten()
        .ok_or(TroupeError::NotConnected)?;
    puppeteer.finish().await;
    Ok(last)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = Settings::from_env();
    let role = std::env::args().nth(1).unwrap_or_else(|| "both".to_string());
    tracing::info!(?settings, %role, "starting ping-pong");

    match role.as_str() {
        "server" => {
            let (handle, addr) = serve(&settings).await?;
            tracing::info!(%addr, "waiting for players; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            handle.stop();
        }
        "client" => {
            let last = play(&settings, &settings.addr()).await?;
            tracing::info!(last, "rally over");
        }
        _ => {
            let (handle, addr) = serve(&settings).await?;
            let last = play(&settings, &addr).await?;
            tracing::info!(last, "rally over");
            handle.stop();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(secure: bool) -> Settings {
        Settings {
            host: "127.0.0.1".to_string(),
            port: 0,
            key_bits: 512,
            secure,
            volleys: 4,
        }
    }

    #[tokio::test]
    async fn test_plain_rally() {
        let settings = settings(false);
        let (handle, addr) = serve(&settings).await.unwrap();
        assert_eq!(play(&settings, &addr).await.unwrap(), 3);
        handle.stop();
    }

    #[tokio::test]
    async fn test_secure_rally() {
        let settings = settings(true);
        let (handle, addr) = serve(&settings).await.unwrap();
        assert_eq!(play(&settings, &addr).await.unwrap(), 3);
        handle.stop();
    }
}
