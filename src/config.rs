use clap::{value_parser, Args, Parser};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Auth;
use crate::error::{ProxyError, ProxyResult};

/// Protocol spoken by the upstream proxy
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpstreamProtocol {
    /// HTTP proxy reached with CONNECT
    HttpConnect,
    /// SOCKS5 proxy
    Socks5,
}

impl FromStr for UpstreamProtocol {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::HttpConnect),
            "socks5" => Ok(Self::Socks5),
            other => Err(ProxyError::ConfigInvalid(format!(
                "unknown upstream protocol {:?}, expected \"http\" or \"socks5\"",
                other
            ))),
        }
    }
}

impl std::fmt::Display for UpstreamProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HttpConnect => f.write_str("http"),
            Self::Socks5 => f.write_str("socks5"),
        }
    }
}

/// Upstream proxy credentials
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// Upstream proxy username
    #[arg(short = 'u', long = "user")]
    pub username: Option<String>,

    /// Upstream proxy password
    #[arg(short = 'P', long)]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Local HTTP proxy forwarding through an upstream HTTP or SOCKS5 proxy",
    long_about = "tunnel-syndrome listens locally as a plain HTTP/HTTPS proxy and relays every request through one upstream proxy.\n\nUpstream types:\n- http   : HTTP proxy, tunnels opened with CONNECT (optional Basic auth)\n- socks5 : SOCKS5 proxy (optional username/password auth)\n"
)]
pub struct Cli {
    /// Upstream proxy protocol: http or socks5
    #[arg(short = 't', long = "type", value_name = "PROTOCOL")]
    pub protocol: String,

    /// Upstream proxy host (a leading http:// is ignored, https:// enables TLS)
    #[arg(short = 'x', long = "proxy", value_name = "HOST")]
    pub proxy_host: String,

    /// Upstream proxy port
    #[arg(long = "proxy-port", value_name = "PORT")]
    pub proxy_port: u16,

    /// Local port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// IP address to bind the local listener
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub listen_ip: IpAddr,

    #[command(flatten)]
    pub auth: Option<Auths>,

    /// Use TLS to reach the upstream HTTP proxy
    #[arg(long = "upstream-tls", default_value_t = false)]
    pub upstream_tls: bool,

    /// Timeout in seconds for reaching the upstream proxy
    #[arg(long, value_parser = value_parser!(u64).range(1..), default_value_t = 10)]
    pub connect_timeout: u64,

    /// Idle timeout in seconds for tunnels, 0 disables it
    #[arg(long, default_value_t = 0)]
    pub idle_timeout: u64,
}

/// Where and how to reach the upstream proxy
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub protocol: UpstreamProtocol,
    pub host: String,
    pub port: u16,
    pub auth: Option<Auth>,
    pub tls: bool,
    pub connect_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(protocol: UpstreamProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            auth: None,
            tls: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auth(mut self, auth: Option<Auth>) -> Self {
        self.auth = auth;
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn validate(&self) -> ProxyResult<()> {
        if self.host.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid("upstream host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(ProxyError::ConfigInvalid("upstream port must be 1-65535".to_string()));
        }
        if self.tls && self.protocol == UpstreamProtocol::Socks5 {
            return Err(ProxyError::ConfigInvalid(
                "TLS is only supported for http upstreams".to_string(),
            ));
        }
        Ok(())
    }
}

/// Local listener settings
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub listen_addr: SocketAddr,
}

/// Proxy configuration derived from CLI arguments, immutable once built
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub upstream: Arc<UpstreamConfig>,
    pub listener: ListenerConfig,
    pub idle_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn new(upstream: UpstreamConfig, listen_addr: SocketAddr) -> ProxyResult<Self> {
        upstream.validate()?;
        Ok(Self {
            upstream: Arc::new(upstream),
            listener: ListenerConfig { listen_addr },
            idle_timeout: None,
        })
    }

    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> ProxyResult<Self> {
        let protocol: UpstreamProtocol = args.protocol.parse()?;
        let (host, scheme_tls) = strip_scheme(&args.proxy_host);

        let (username, password) = match args.auth {
            Some(a) => (a.username, a.password),
            None => (None, None),
        };
        if username.is_none() && password.is_some() {
            return Err(ProxyError::ConfigInvalid(
                "a password was given without a username".to_string(),
            ));
        }

        if args.port == 0 {
            return Err(ProxyError::ConfigInvalid("local port must be 1-65535".to_string()));
        }

        let mut upstream = UpstreamConfig::new(protocol, host, args.proxy_port)
            .with_auth(Auth::from_parts(username, password));
        upstream.tls = args.upstream_tls || scheme_tls;
        upstream.connect_timeout = Duration::from_secs(args.connect_timeout);

        let mut config = Self::new(upstream, SocketAddr::new(args.listen_ip, args.port))?;
        config.idle_timeout = (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout));
        Ok(config)
    }
}

/// Drop a leading `http://` or `https://` and any trailing slash from the
/// upstream host. Returns whether the scheme asked for TLS.
pub fn strip_scheme(host: &str) -> (&str, bool) {
    let host = host.trim();
    let (rest, tls) = if let Some(rest) = host.strip_prefix("https://") {
        (rest, true)
    } else if let Some(rest) = host.strip_prefix("http://") {
        (rest, false)
    } else {
        (host, false)
    };
    (rest.trim_end_matches('/'), tls)
}
