//! Raw-socket whois client with referral chasing.
//!
//! A query opens a plain TCP connection to port 43 (or the explicit port
//! in the host string), writes the query line, and collects bytes until
//! the peer closes, all inside one hard per-attempt timeout. Replies may
//! point at a more specific registry; the walk follows those referrals a
//! bounded number of hops and remembers the first one as a
//! [`Referral`](super::Referral) hint for future lookups.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::config::WhoisConfig;
use crate::whois::{Extracted, Referral, WhoisResult, extract, parser};

/// One step of the referral walk.
enum Hop {
    /// About to query `host`; `prev` holds the best earlier extraction.
    Querying { host: String, prev: Option<Extracted> },
    /// Walk finished with a usable extraction.
    Done(Extracted),
    /// No hop produced a usable range.
    Failed,
}

/// Whois protocol client.
#[derive(Debug, Clone)]
pub struct WhoisClient {
    config: WhoisConfig,
}

impl WhoisClient {
    /// Create a client from configuration.
    pub fn new(config: WhoisConfig) -> Self {
        Self { config }
    }

    /// Look up the ownership block for `addr`, starting at `start_host`
    /// (a cached referral hint) or the configured default registry.
    ///
    /// Returns `None` only when no hop yields a usable range; every other
    /// missing field is simply omitted from the result.
    pub async fn query(&self, addr: Address, start_host: Option<&str>) -> Option<WhoisResult> {
        let first_host = start_host.unwrap_or(&self.config.default_host).to_string();
        let query = addr.canonical();

        let mut state = Hop::Querying {
            host: first_host,
            prev: None,
        };
        let mut hint: Option<Referral> = None;
        let mut last_host = String::new();
        let mut hops = 0u32;

        let mut done = loop {
            match state {
                Hop::Querying { host, prev } => {
                    hops += 1;
                    last_host = host.clone();
                    let raw = match self.query_once(&host, &query).await {
                        Some(raw) => raw,
                        None => {
                            // Attempt failed; an earlier hop may still carry a range.
                            state = match prev {
                                Some(p) if p.range.is_some() => Hop::Done(p),
                                _ => Hop::Failed,
                            };
                            continue;
                        }
                    };

                    let reply = parser::parse_reply(&raw);
                    let current = merge_hops(prev.as_ref(), extract(&reply, addr.family()));

                    let referral = parser::find_referral(&raw)
                        .filter(|next| !next.eq_ignore_ascii_case(&host));
                    match referral {
                        Some(next) if hops < self.config.max_hops => {
                            debug!(ip = %addr, from = %host, to = %next, "Following whois referral");
                            if hint.is_none()
                                && let Some((start, end, mask_bits)) = current.range
                            {
                                hint = Some(Referral {
                                    host: next.clone(),
                                    start,
                                    end,
                                    mask_bits,
                                });
                            }
                            state = Hop::Querying {
                                host: next,
                                prev: Some(current),
                            };
                        }
                        _ => {
                            state = if current.range.is_some() {
                                Hop::Done(current)
                            } else {
                                Hop::Failed
                            };
                        }
                    }
                }
                Hop::Done(extracted) => break extracted,
                Hop::Failed => {
                    debug!(ip = %addr, host = %last_host, "Whois walk found no usable range");
                    return None;
                }
            }
        };

        // APNIC and AFRINIC blocks routinely omit the origin AS; RIPE
        // carries the delegation. One extra best-effort query fills it in.
        if done.asn.is_none() && !last_host.eq_ignore_ascii_case(&self.config.asn_fallback_host) {
            done.asn = self.asn_from_fallback(&query, addr).await;
        }

        let (start, end, mask_bits) = done.range?;
        Some(WhoisResult {
            start,
            end,
            mask_bits,
            country: done.country,
            org: done.org,
            descr: done.descr,
            asn: done.asn,
            referral: hint,
        })
    }

    async fn asn_from_fallback(&self, query: &str, addr: Address) -> Option<u32> {
        let raw = self
            .query_once(&self.config.asn_fallback_host, query)
            .await?;
        let reply = parser::parse_reply(&raw);
        extract(&reply, addr.family()).asn
    }

    /// One protocol round trip: connect, send the query line, drain until
    /// the peer closes. Any error or timeout is a failed attempt.
    async fn query_once(&self, host: &str, query: &str) -> Option<String> {
        let target = host_port(host);
        let attempt = async {
            let mut stream = TcpStream::connect(&target).await?;
            stream.write_all(query.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };

        match tokio::time::timeout(self.config.timeout(), attempt).await {
            Ok(Ok(buf)) => Some(String::from_utf8_lossy(&buf).into_owned()),
            Ok(Err(e)) => {
                warn!(host = %target, error = %e, "Whois query failed");
                None
            }
            Err(_) => {
                warn!(host = %target, "Whois query timed out");
                None
            }
        }
    }
}

/// Later hops override earlier ones; fields the later hop lacks fall back
/// to the previous hop (in practice the range, when a contact-only reply
/// comes back from the referred server).
fn merge_hops(prev: Option<&Extracted>, current: Extracted) -> Extracted {
    let Some(prev) = prev else {
        return current;
    };
    Extracted {
        range: current.range.or(prev.range),
        country: current.country.or_else(|| prev.country.clone()),
        org: current.org.or_else(|| prev.org.clone()),
        descr: current.descr.or_else(|| prev.descr.clone()),
        asn: current.asn.or(prev.asn),
    }
}

/// Append the default whois port when the host string doesn't carry one.
fn host_port(host: &str) -> String {
    match host.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            host.to_string()
        }
        _ => format!("{}:43", host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned reply per connection, counting hits.
    async fn spawn_whois_stub(reply: String) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (format!("127.0.0.1:{}", addr.port()), hits)
    }

    fn test_config() -> WhoisConfig {
        WhoisConfig {
            default_host: "127.0.0.1:1".to_string(),
            timeout_secs: 2,
            max_hops: 5,
            // Point the fallback somewhere dead so tests never hit the network.
            asn_fallback_host: "127.0.0.1:1".to_string(),
        }
    }

    #[test]
    fn test_host_port() {
        assert_eq!(host_port("whois.ripe.net"), "whois.ripe.net:43");
        assert_eq!(host_port("rwhois.example.net:4321"), "rwhois.example.net:4321");
        assert_eq!(host_port("bad:port:"), "bad:port::43");
    }

    #[tokio::test]
    async fn test_query_plain_reply() {
        let (host, hits) = spawn_whois_stub(
            "inetnum: 192.0.2.0 - 192.0.2.255\ncountry: NL\norigin: AS64500\n".to_string(),
        )
        .await;

        let client = WhoisClient::new(test_config());
        let addr = Address::parse("192.0.2.5").unwrap();
        let result = client.query(addr, Some(&host)).await.unwrap();

        assert_eq!(result.start, 0xc000_0200);
        assert_eq!(result.end, 0xc000_02ff);
        assert_eq!(result.mask_bits, 24);
        assert_eq!(result.country.as_deref(), Some("nl"));
        assert_eq!(result.asn, Some(64500));
        assert!(result.referral.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_referral_followed_once_and_hinted() {
        let (leaf_host, leaf_hits) = spawn_whois_stub(
            "inetnum: 192.0.2.0 - 192.0.2.127\ncountry: DE\norigin: AS64501\n".to_string(),
        )
        .await;
        let (root_host, root_hits) = spawn_whois_stub(format!(
            "inetnum: 192.0.0.0 - 192.0.255.255\ncountry: EU\nrefer: {}\n",
            leaf_host
        ))
        .await;

        let client = WhoisClient::new(test_config());
        let addr = Address::parse("192.0.2.5").unwrap();
        let result = client.query(addr, Some(&root_host)).await.unwrap();

        // The leaf's more specific data wins.
        assert_eq!((result.start, result.end), (0xc000_0200, 0xc000_027f));
        assert_eq!(result.country.as_deref(), Some("de"));
        assert_eq!(result.asn, Some(64501));

        // The hint records the first hop's range with the referred host.
        let hint = result.referral.unwrap();
        assert_eq!(hint.host, leaf_host);
        assert_eq!((hint.start, hint.end), (0xc000_0000, 0xc000_ffff));

        assert_eq!(root_hits.load(Ordering::SeqCst), 1);
        assert_eq!(leaf_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_referral_without_range_falls_back() {
        // The referred server replies with contact noise only.
        let (leaf_host, _) = spawn_whois_stub("role: Useless Contact\n".to_string()).await;
        let (root_host, _) = spawn_whois_stub(format!(
            "inetnum: 198.51.100.0 - 198.51.100.255\ncountry: US\nrefer: {}\n",
            leaf_host
        ))
        .await;

        let client = WhoisClient::new(test_config());
        let addr = Address::parse("198.51.100.7").unwrap();
        let result = client.query(addr, Some(&root_host)).await.unwrap();

        assert_eq!((result.start, result.end), (0xc633_6400, 0xc633_64ff));
        assert_eq!(result.country.as_deref(), Some("us"));
    }

    #[tokio::test]
    async fn test_referral_loop_is_bounded() {
        // A server that refers to itself must not walk forever. The
        // self-referral is ignored outright (same host), ending the walk.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = format!("127.0.0.1:{}", port);
        let reply = format!("inetnum: 203.0.113.0 - 203.0.113.255\nrefer: {}\n", host);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(reply.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        let client = WhoisClient::new(test_config());
        let addr = Address::parse("203.0.113.5").unwrap();
        let result = client.query(addr, Some(&host)).await.unwrap();
        assert_eq!(result.mask_bits, 24);
    }

    #[tokio::test]
    async fn test_unreachable_host_returns_none() {
        let client = WhoisClient::new(test_config());
        let addr = Address::parse("203.0.113.5").unwrap();
        // Nothing listens on the default host (127.0.0.1:1).
        assert!(client.query(addr, None).await.is_none());
    }
}
