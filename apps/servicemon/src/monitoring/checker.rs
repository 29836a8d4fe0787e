use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HOST, HeaderValue, SERVER, USER_AGENT};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Host;

use super::types::Verdict;
use super::validation::{parse_http_url, parse_port, parse_timeout};
use crate::database::models::CheckerSpec;
use crate::error::CheckerError;

/// Checker trait for the protocol probes
#[async_trait]
pub trait Checker: Send + Sync {
    /// Probe the service once. Errors are turned into DOWN verdicts by the
    /// executor.
    async fn execute(&self) -> Result<Verdict, CheckerError>;

    /// Upper bound for one execution
    fn timeout(&self) -> Duration;
}

/// Static description of a checker type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerKind {
    pub type_name: &'static str,
    pub description: &'static str,
    pub ipv6_support: bool,
    /// Port used when no argument says otherwise; 0 means derived from args
    pub default_port: u16,
    pub required_args: &'static [&'static str],
    /// Argument names with the default applied when they are absent
    pub optional_args: &'static [(&'static str, &'static str)],
}

/// Settings shared by every checker unless its arguments override them
#[derive(Debug, Clone, Copy)]
pub struct CheckDefaults {
    pub timeout: Duration,
}

impl Default for CheckDefaults {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10) }
    }
}

/// `timeout` argument or the configured default
fn checker_timeout(spec: &CheckerSpec, defaults: &CheckDefaults) -> Result<Duration, CheckerError> {
    spec.arg("timeout").map(parse_timeout).transpose().map(|t| t.unwrap_or(defaults.timeout))
}

/// Render an error with all of its sources, outermost first.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.ends_with(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}

/// HTTP/HTTPS checker
///
/// Always connects to the monitored address. A host name in the `url`
/// argument is only used as the virtual host.
pub struct HttpChecker {
    client: reqwest::Client,
    url: url::Url,
    host_header: Option<HeaderValue>,
    timeout: Duration,
}

impl HttpChecker {
    pub const HTTP: CheckerKind = CheckerKind {
        type_name: "http",
        description: "Fetches a document over HTTP; 2xx and 3xx responses are up",
        ipv6_support: true,
        default_port: 80,
        required_args: &[],
        optional_args: &[("url", "/"), ("port", "80"), ("timeout", "")],
    };

    pub const HTTPS: CheckerKind = CheckerKind {
        type_name: "https",
        description: "Fetches a document over HTTPS; 2xx and 3xx responses are up",
        ipv6_support: true,
        default_port: 443,
        required_args: &[],
        optional_args: &[("url", "/"), ("port", "443"), ("timeout", ""), ("verify", "false")],
    };

    pub fn new(spec: &CheckerSpec, defaults: &CheckDefaults, tls: bool) -> Result<Self, CheckerError> {
        let (scheme, default_port) = if tls { ("https", 443) } else { ("http", 80) };
        let target = parse_http_url(spec.arg("url").unwrap_or("/"))?;
        let port = match spec.arg("port") {
            Some(raw) => parse_port(raw)?,
            None => target.port.unwrap_or(default_port),
        };
        let timeout = checker_timeout(spec, defaults)?;
        let verify = spec.arg("verify").is_some_and(|v| matches!(v, "1" | "true" | "yes"));

        let mut builder = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout)
            .timeout(timeout)
            .danger_accept_invalid_certs(tls && !verify);

        let address = match spec.ip {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        let mut host_header = None;
        let url_host = match &target.host {
            Some(Host::Domain(name)) => {
                builder = builder.resolve(name, SocketAddr::new(spec.ip, port));
                name.clone()
            }
            Some(literal) => {
                host_header = HeaderValue::from_str(&literal.to_string()).ok();
                address
            }
            None => address,
        };

        let raw_url = format!("{scheme}://{url_host}:{port}{}", target.path);
        let url = url::Url::parse(&raw_url).map_err(|e| CheckerError::invalid("url", raw_url.as_str(), e))?;
        let client = builder.build().map_err(|e| CheckerError::Http(error_chain(&e)))?;

        Ok(Self { client, url, host_header, timeout })
    }
}

#[async_trait]
impl Checker for HttpChecker {
    async fn execute(&self) -> Result<Verdict, CheckerError> {
        let mut request = self
            .client
            .get(self.url.clone())
            .header(USER_AGENT, concat!("servicemon/", env!("CARGO_PKG_VERSION")));
        if let Some(host) = &self.host_header {
            request = request.header(HOST, host.clone());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() { CheckerError::Timeout(self.timeout) } else { CheckerError::Http(error_chain(&e)) }
        })?;

        let code = response.status().as_u16();
        let server = response
            .headers()
            .get(SERVER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string());

        // Consider 2xx and 3xx as success
        let verdict = if response.status().is_success() || response.status().is_redirection() {
            Verdict::up(format!("OK ({code}) {}", server.as_deref().unwrap_or("")).trim_end())
        } else {
            Verdict::down(format!("ERROR ({code}) {}", self.url))
        };
        Ok(verdict.with_version(server))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// TCP port checker
pub struct PortChecker {
    address: SocketAddr,
    timeout: Duration,
}

impl PortChecker {
    pub const KIND: CheckerKind = CheckerKind {
        type_name: "port",
        description: "Opens a TCP connection to the given port",
        ipv6_support: true,
        default_port: 0,
        required_args: &["port"],
        optional_args: &[("timeout", "")],
    };

    pub fn new(spec: &CheckerSpec, defaults: &CheckDefaults) -> Result<Self, CheckerError> {
        let port = parse_port(spec.arg("port").ok_or(CheckerError::MissingArgument("port"))?)?;
        Ok(Self { address: SocketAddr::new(spec.ip, port), timeout: checker_timeout(spec, defaults)? })
    }
}

#[async_trait]
impl Checker for PortChecker {
    async fn execute(&self) -> Result<Verdict, CheckerError> {
        timeout(self.timeout, TcpStream::connect(self.address))
            .await
            .map_err(|_| CheckerError::Timeout(self.timeout))?
            .map_err(CheckerError::Connect)?;

        Ok(Verdict::up(format!("connected to port {}", self.address.port())))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// SSH checker: reads the server identification line
pub struct SshChecker {
    address: SocketAddr,
    timeout: Duration,
}

impl SshChecker {
    pub const KIND: CheckerKind = CheckerKind {
        type_name: "ssh",
        description: "Reads the SSH identification banner and reports the server version",
        ipv6_support: true,
        default_port: 22,
        required_args: &[],
        optional_args: &[("port", "22"), ("timeout", "")],
    };

    pub fn new(spec: &CheckerSpec, defaults: &CheckDefaults) -> Result<Self, CheckerError> {
        let port = spec.arg("port").map(parse_port).transpose()?.unwrap_or(Self::KIND.default_port);
        Ok(Self { address: SocketAddr::new(spec.ip, port), timeout: checker_timeout(spec, defaults)? })
    }

    async fn read_banner(&self) -> Result<String, CheckerError> {
        let stream = TcpStream::connect(self.address).await.map_err(CheckerError::Connect)?;
        let mut banner = String::new();
        BufReader::new(stream).read_line(&mut banner).await.map_err(CheckerError::Connect)?;
        Ok(banner.trim_end().to_string())
    }
}

#[async_trait]
impl Checker for SshChecker {
    async fn execute(&self) -> Result<Verdict, CheckerError> {
        let banner = timeout(self.timeout, self.read_banner()).await.map_err(|_| CheckerError::Timeout(self.timeout))??;

        // SSH-protoversion-softwareversion SP comments
        if !banner.starts_with("SSH-") {
            return Ok(Verdict::down(format!("unexpected banner: {banner:?}")));
        }
        let software = banner.splitn(3, '-').nth(2).and_then(|rest| rest.split_whitespace().next());
        match software {
            Some(version) => Ok(Verdict::up(banner.clone()).with_version(Some(version.to_string()))),
            None => Err(CheckerError::Protocol(format!("malformed identification: {banner}"))),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::ServiceStatus;
    use crate::testing::spec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one connection with `response` and hand back the request head.
    async fn serve_once(response: &'static str) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (port, handle)
    }

    fn http_spec(port: u16, url: &str) -> CheckerSpec {
        let mut spec = spec(1, "http");
        spec.args.insert("port".into(), port.to_string());
        spec.args.insert("url".into(), url.into());
        spec
    }

    #[tokio::test]
    async fn test_http_ok_reports_server_version() {
        let (port, server) =
            serve_once("HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;

        let checker = HttpChecker::new(&http_spec(port, "/"), &CheckDefaults::default(), false).unwrap();
        let verdict = checker.execute().await.unwrap();

        assert_eq!(verdict.status, ServiceStatus::Up);
        assert_eq!(verdict.info, "OK (200) nginx");
        assert_eq!(verdict.version.as_deref(), Some("nginx"));

        let request = server.await.unwrap().to_lowercase();
        assert!(request.contains(concat!("user-agent: servicemon/", env!("CARGO_PKG_VERSION"))));
    }

    #[tokio::test]
    async fn test_http_server_error_is_down() {
        let (port, _server) =
            serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;

        let checker = HttpChecker::new(&http_spec(port, "/health"), &CheckDefaults::default(), false).unwrap();
        let verdict = checker.execute().await.unwrap();

        assert_eq!(verdict.status, ServiceStatus::Down);
        assert!(verdict.info.starts_with("ERROR (500) "), "info was {}", verdict.info);
        assert!(verdict.info.ends_with("/health"));
    }

    #[tokio::test]
    async fn test_http_redirect_is_up() {
        let (port, _server) = serve_once(
            "HTTP/1.1 302 Found\r\nLocation: /login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let checker = HttpChecker::new(&http_spec(port, "/"), &CheckDefaults::default(), false).unwrap();
        let verdict = checker.execute().await.unwrap();

        assert_eq!(verdict.status, ServiceStatus::Up);
        assert_eq!(verdict.info, "OK (302)");
        assert_eq!(verdict.version, None);
    }

    #[tokio::test]
    async fn test_http_sends_virtual_host_to_monitored_address() {
        let (port, server) =
            serve_once("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;

        let spec = http_spec(port, "http://www.example.org/status?full=1");
        let checker = HttpChecker::new(&spec, &CheckDefaults::default(), false).unwrap();
        let verdict = checker.execute().await.unwrap();
        assert_eq!(verdict.status, ServiceStatus::Up);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get /status?full=1 http/1.1\r\n"), "request was {request}");
        assert!(request.contains("host: www.example.org"));
    }

    #[tokio::test]
    async fn test_http_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut spec = http_spec(port, "/");
        spec.args.insert("timeout".into(), "0.3".into());
        let checker = HttpChecker::new(&spec, &CheckDefaults::default(), false).unwrap();

        let err = checker.execute().await.unwrap_err();
        assert!(matches!(err, CheckerError::Timeout(_)));
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_http_rejects_malformed_url() {
        let result = HttpChecker::new(&http_spec(80, "http://exa mple.org/"), &CheckDefaults::default(), false);
        assert!(matches!(result, Err(CheckerError::InvalidArgument { name: "url", .. })));
    }

    #[tokio::test]
    async fn test_port_checker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut spec = spec(2, "port");
        spec.args.insert("port".into(), listener.local_addr().unwrap().port().to_string());

        let checker = PortChecker::new(&spec, &CheckDefaults::default()).unwrap();
        assert_eq!(checker.execute().await.unwrap().status, ServiceStatus::Up);

        drop(listener);
        assert!(matches!(checker.execute().await, Err(CheckerError::Connect(_))));
    }

    #[test]
    fn test_port_checker_requires_port() {
        let result = PortChecker::new(&spec(2, "port"), &CheckDefaults::default());
        assert!(matches!(result, Err(CheckerError::MissingArgument("port"))));
    }

    /// Send `banner` to the first client, like an SSH server does on accept.
    async fn announce(banner: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(banner.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_ssh_banner_version() {
        let mut spec = spec(3, "ssh");
        spec.args.insert("port".into(), announce("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13\r\n").await.to_string());

        let checker = SshChecker::new(&spec, &CheckDefaults::default()).unwrap();
        let verdict = checker.execute().await.unwrap();
        assert_eq!(verdict.status, ServiceStatus::Up);
        assert_eq!(verdict.version.as_deref(), Some("OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_ssh_wrong_banner_is_down() {
        let mut spec = spec(3, "ssh");
        spec.args.insert("port".into(), announce("220 mail.example.org ESMTP\r\n").await.to_string());

        let checker = SshChecker::new(&spec, &CheckDefaults::default()).unwrap();
        let verdict = checker.execute().await.unwrap();
        assert_eq!(verdict.status, ServiceStatus::Down);
        assert_eq!(verdict.version, None);
    }

    #[test]
    fn test_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = CheckerError::Connect(io);
        assert_eq!(error_chain(&err), "connection failed: refused");
    }
}
