//! Public address probes through a proxy-core data plane

use crate::proxy::models::IpFamily;
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// Default timeout for one probe in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// ip.sb answers 403 to the default reqwest agent
const DEFAULT_USER_AGENT: &str = "Mozilla";

const DEFAULT_IPV4_URL: &str = "https://api-ipv4.ip.sb/ip";
const DEFAULT_IPV6_URL: &str = "https://api-ipv6.ip.sb/ip";

/// Configuration for address probes
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// User agent sent to the echo service
    pub user_agent: String,
    /// Echo endpoint reachable only over IPv4
    pub ipv4_url: String,
    /// Echo endpoint reachable only over IPv6
    pub ipv6_url: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ipv4_url: DEFAULT_IPV4_URL.to_string(),
            ipv6_url: DEFAULT_IPV6_URL.to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_echo_urls(mut self, ipv4_url: String, ipv6_url: String) -> Self {
        self.ipv4_url = ipv4_url;
        self.ipv6_url = ipv6_url;
        self
    }

    pub fn url(&self, family: IpFamily) -> &str {
        match family {
            IpFamily::Ipv4 => &self.ipv4_url,
            IpFamily::Ipv6 => &self.ipv6_url,
        }
    }
}

/// Asks an echo service for the caller's public address
#[async_trait]
pub trait IpEcho: Send + Sync {
    /// Public address of `family` seen through the SOCKS endpoint at `proxy`,
    /// or `None` when the family is unreachable
    async fn fetch(&self, family: IpFamily, proxy: SocketAddr) -> Option<String>;
}

/// [`IpEcho`] over HTTPS through a local SOCKS5 endpoint
#[derive(Debug, Clone, Default)]
pub struct HttpEcho {
    config: ProbeConfig,
}

impl HttpEcho {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Hostnames are resolved by the node (`socks5h`), so the IPv6 echo
    /// host gets its AAAA lookup on the remote side
    fn create_client(&self, proxy: SocketAddr) -> reqwest::Result<Client> {
        let proxy = ReqwestProxy::all(format!("socks5h://{}", proxy))?;

        Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .user_agent(&self.config.user_agent)
            .build()
    }

    async fn request(&self, family: IpFamily, proxy: SocketAddr) -> reqwest::Result<String> {
        let client = self.create_client(proxy)?;
        client
            .get(self.config.url(family))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl IpEcho for HttpEcho {
    async fn fetch(&self, family: IpFamily, proxy: SocketAddr) -> Option<String> {
        let body = match tokio::time::timeout(self.config.timeout, self.request(family, proxy)).await
        {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                debug!(%family, %proxy, error = %e, "probe failed");
                return None;
            }
            Err(_) => {
                debug!(%family, %proxy, "probe timed out");
                return None;
            }
        };

        parse_address(&body).or_else(|| {
            debug!(%family, %proxy, body = %body.trim(), "echo returned no address");
            None
        })
    }
}

/// Extract the address from an echo response body
pub fn parse_address(body: &str) -> Option<String> {
    let text = body.trim();
    text.parse::<IpAddr>().ok().map(|_| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// SOCKS5 endpoint that answers every CONNECT itself with a plain HTTP
    /// response carrying `body`; records the requested targets
    async fn socks_echo(body: &'static str) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let targets = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&targets);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = serve_socks(stream, body, &seen).await;
                });
            }
        });

        (addr, targets)
    }

    async fn serve_socks(
        mut stream: TcpStream,
        body: &str,
        seen: &Mutex<Vec<String>>,
    ) -> std::io::Result<()> {
        // Greeting: version, method count, methods
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;
        stream.write_all(&[5, 0]).await?;

        // Request: version, command, reserved, address type
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        let host = match request[3] {
            1 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv4Addr::from(ip).to_string()
            }
            3 => {
                let len = stream.read_u8().await?;
                let mut name = vec![0u8; len as usize];
                stream.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).to_string()
            }
            _ => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv6Addr::from(ip).to_string()
            }
        };
        let port = stream.read_u16().await?;
        seen.lock().push(format!("{}:{}", host, port));
        stream.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    fn echo_through_socks() -> HttpEcho {
        HttpEcho::with_config(
            ProbeConfig::new()
                .with_timeout(Duration::from_secs(2))
                .with_echo_urls("http://v4.echo.test/ip".to_string(), "http://v6.echo.test/ip".to_string()),
        )
    }

    #[test]
    fn test_probe_config_default() {
        let config = ProbeConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.url(IpFamily::Ipv4), DEFAULT_IPV4_URL);
        assert_eq!(config.url(IpFamily::Ipv6), DEFAULT_IPV6_URL);
    }

    #[test]
    fn test_probe_config_builder() {
        let config = ProbeConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_user_agent("curl/8.0".to_string())
            .with_echo_urls("http://v4.test/ip".to_string(), "http://v6.test/ip".to_string());

        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.user_agent, "curl/8.0");
        assert_eq!(config.url(IpFamily::Ipv6), "http://v6.test/ip");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("203.0.113.5\n"), Some("203.0.113.5".to_string()));
        assert_eq!(parse_address("2001:db8::1"), Some("2001:db8::1".to_string()));
        assert_eq!(parse_address("<html>403 Forbidden</html>"), None);
        assert_eq!(parse_address(""), None);
    }

    #[tokio::test]
    async fn test_fetch_reads_address_through_socks() {
        let (addr, targets) = socks_echo("203.0.113.7\n").await;
        let echo = echo_through_socks();

        assert_eq!(
            echo.fetch(IpFamily::Ipv4, addr).await,
            Some("203.0.113.7".to_string())
        );
        // The hostname travels to the proxy unresolved
        assert_eq!(targets.lock().clone(), vec!["v4.echo.test:80".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_address_body() {
        let (addr, _) = socks_echo("<html>blocked</html>").await;
        let echo = echo_through_socks();

        assert_eq!(echo.fetch(IpFamily::Ipv6, addr).await, None);
    }

    #[tokio::test]
    async fn test_silent_endpoint_yields_none() {
        // Accepts connections and never answers the SOCKS greeting
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let echo = HttpEcho::with_config(ProbeConfig::new().with_timeout(Duration::from_millis(200)));
        let started = std::time::Instant::now();
        assert_eq!(echo.fetch(IpFamily::Ipv4, addr).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_closed_endpoint_yields_none() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let echo = HttpEcho::with_config(ProbeConfig::new().with_timeout(Duration::from_millis(500)));
        assert_eq!(echo.fetch(IpFamily::Ipv6, addr).await, None);
    }
}
