use std::error::Error as StdError;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{Client, Method, RequestBuilder, Response, redirect, tls};
use tracing::debug;
use url::{Host, Url};

use crate::error::{BlockedAddress, DialError};

pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0 Safari/537.36";
const MAX_REDIRECTS: usize = 5;

type BoxError = Box<dyn StdError + Send + Sync>;

// IPv4-mapped IPv6 addresses are judged by their IPv4 part.
pub fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_multicast()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_disallowed_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_unique_local(&v6)
                || is_unicast_link_local(&v6)
        }
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerPolicy {
    allow_private: bool,
}

impl PeerPolicy {
    pub fn strict() -> Self {
        Self {
            allow_private: false,
        }
    }

    pub fn permissive() -> Self {
        Self {
            allow_private: true,
        }
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allow_private || !is_disallowed_ip(ip)
    }

    pub fn check_peer(&self, peer: SocketAddr) -> Result<(), DialError> {
        if self.allows(peer.ip()) {
            Ok(())
        } else {
            Err(DialError::NotAllowed(peer.ip()))
        }
    }

    pub fn validate_url(&self, raw: &str) -> Result<Url, DialError> {
        let url = Url::parse(raw).map_err(|err| DialError::InvalidUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DialError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if url.host().is_none() {
            return Err(DialError::InvalidUrl {
                url: raw.to_string(),
                reason: String::from("missing host"),
            });
        }
        match literal_ip(&url) {
            Some(ip) if !self.allows(ip) => Err(DialError::NotAllowed(ip)),
            _ => Ok(url),
        }
    }
}

fn literal_ip(url: &Url) -> Option<IpAddr> {
    match url.host()? {
        Host::Ipv4(v4) => Some(IpAddr::V4(v4)),
        Host::Ipv6(v6) => Some(IpAddr::V6(v6)),
        Host::Domain(_) => None,
    }
}

struct GuardedResolver {
    policy: PeerPolicy,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(lookup_allowed(name.as_str().to_string(), self.policy))
    }
}

async fn lookup_allowed(host: String, policy: PeerPolicy) -> Result<Addrs, BoxError> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .collect();
    let allowed: Vec<SocketAddr> = resolved
        .iter()
        .copied()
        .filter(|addr| policy.allows(addr.ip()))
        .collect();
    if allowed.is_empty() {
        return match resolved.first() {
            Some(blocked) => Err(Box::new(BlockedAddress(blocked.ip()))),
            None => Err(format!("no addresses found for {host}").into()),
        };
    }
    debug!(%host, addresses = allowed.len(), "resolved");
    Ok(Box::new(allowed.into_iter()))
}

fn redirect_policy(policy: PeerPolicy) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.stop();
        }
        match literal_ip(attempt.url()) {
            Some(ip) if !policy.allows(ip) => attempt.error(BlockedAddress(ip)),
            _ => attempt.follow(),
        }
    })
}

fn find_blocked(err: &(dyn StdError + 'static)) -> Option<IpAddr> {
    let mut cause = Some(err);
    while let Some(current) = cause {
        if let Some(blocked) = current.downcast_ref::<BlockedAddress>() {
            return Some(blocked.0);
        }
        cause = current.source();
    }
    None
}

#[derive(Clone)]
pub struct TrustedDialer {
    client: Client,
    policy: PeerPolicy,
    timeout: Duration,
}

impl TrustedDialer {
    pub fn new(timeout: Duration, policy: PeerPolicy) -> Result<Self, DialError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .min_tls_version(tls::Version::TLS_1_2)
            .dns_resolver(Arc::new(GuardedResolver { policy }))
            .redirect(redirect_policy(policy))
            .build()
            .map_err(DialError::Transport)?;
        Ok(Self {
            client,
            policy,
            timeout,
        })
    }

    pub fn policy(&self) -> PeerPolicy {
        self.policy
    }

    pub fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, DialError> {
        let url = self.policy.validate_url(url)?;
        Ok(self.client.request(method, url))
    }

    pub async fn get(&self, url: &str) -> Result<Response, DialError> {
        self.send(self.request(Method::GET, url)?).await
    }

    pub async fn head(&self, url: &str) -> Result<Response, DialError> {
        self.send(self.request(Method::HEAD, url)?).await
    }

    pub async fn send(&self, request: RequestBuilder) -> Result<Response, DialError> {
        let response = request.send().await.map_err(|err| self.classify(err))?;
        self.admit(response)
    }

    fn admit(&self, response: Response) -> Result<Response, DialError> {
        match response.remote_addr() {
            Some(peer) => {
                self.policy.check_peer(peer)?;
                Ok(response)
            }
            None => {
                debug!(url = %response.url(), "peer address unavailable, skipping post-connect check");
                Ok(response)
            }
        }
    }

    pub fn classify(&self, err: reqwest::Error) -> DialError {
        if let Some(ip) = find_blocked(&err) {
            return DialError::NotAllowed(ip);
        }
        if err.is_timeout() {
            return DialError::Timeout(self.timeout);
        }
        DialError::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{Route, TestServer};
    use std::fmt;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn internal_addresses_are_disallowed() {
        for raw in [
            "127.0.0.1",
            "10.0.0.5",
            "172.16.4.1",
            "192.168.1.20",
            "169.254.1.1",
            "224.0.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "::1",
            "::",
            "fe80::1",
            "fd12:3456::1",
            "ff02::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(is_disallowed_ip(ip(raw)), "{raw} should be disallowed");
        }
    }

    #[test]
    fn public_unicast_is_allowed() {
        for raw in ["93.184.216.34", "1.1.1.1", "2606:4700:4700::1111"] {
            assert!(!is_disallowed_ip(ip(raw)), "{raw} should be allowed");
        }
    }

    #[test]
    fn strict_policy_checks_peer_addresses() {
        let policy = PeerPolicy::strict();
        for raw in ["127.0.0.1:443", "10.0.0.5:80", "169.254.1.1:80", "224.0.0.1:80"] {
            let peer: SocketAddr = raw.parse().unwrap();
            assert!(matches!(
                policy.check_peer(peer),
                Err(DialError::NotAllowed(addr)) if addr == peer.ip()
            ));
        }
        assert!(policy.check_peer("93.184.216.34:443".parse().unwrap()).is_ok());
    }

    #[test]
    fn permissive_policy_accepts_loopback() {
        let policy = PeerPolicy::permissive();
        assert!(policy.check_peer("127.0.0.1:8080".parse().unwrap()).is_ok());
    }

    #[test]
    fn validate_url_rejects_literal_internal_hosts() {
        let policy = PeerPolicy::strict();
        assert!(matches!(
            policy.validate_url("http://127.0.0.1:8080/video.mp4"),
            Err(DialError::NotAllowed(_))
        ));
        assert!(matches!(
            policy.validate_url("http://[::1]/video.mp4"),
            Err(DialError::NotAllowed(_))
        ));
        assert!(matches!(
            policy.validate_url("file:///etc/passwd"),
            Err(DialError::InvalidUrl { .. })
        ));
        assert!(matches!(
            policy.validate_url("not a url"),
            Err(DialError::InvalidUrl { .. })
        ));
        assert!(policy.validate_url("https://cdn.example.com/ep1.mp4").is_ok());
    }

    #[derive(Debug)]
    struct Wrapper(BlockedAddress);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connect failed")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn blocked_address_is_found_in_source_chain() {
        let err = Wrapper(BlockedAddress(ip("10.0.0.5")));
        assert_eq!(find_blocked(&err), Some(ip("10.0.0.5")));
        let plain = std::io::Error::other("boom");
        assert_eq!(find_blocked(&plain), None);
    }

    #[tokio::test]
    async fn strict_dialer_refuses_literal_private_target() {
        let dialer = TrustedDialer::new(Duration::from_secs(2), PeerPolicy::strict()).unwrap();
        let err = dialer.get("http://10.0.0.5/page").await.unwrap_err();
        assert!(matches!(err, DialError::NotAllowed(addr) if addr == ip("10.0.0.5")));
    }

    #[tokio::test]
    async fn permissive_dialer_reaches_loopback_server() {
        let server = TestServer::start(vec![("/hello", Route::Html(String::from("hi")))]).await;
        let dialer = TrustedDialer::new(Duration::from_secs(2), PeerPolicy::permissive()).unwrap();
        let response = dialer.get(&server.url("/hello")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let timeout = Duration::from_millis(300);
        let dialer = TrustedDialer::new(timeout, PeerPolicy::permissive()).unwrap();
        let started = std::time::Instant::now();
        let err = dialer
            .get(&format!("https://127.0.0.1:{port}/"))
            .await
            .unwrap_err();
        silent.abort();

        assert!(matches!(err, DialError::Timeout(t) if t == timeout), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
