use async_trait::async_trait;
use hyper::Uri;
use rand::Rng;
use serde_yaml::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::proxy::{forward, upstream_client, UpstreamClient};
use super::Handler;
use crate::cache::cache_key_str;
use crate::context::RequestCtx;
use crate::error::{FasthttpdError, FasthttpdResult};
use crate::logger::Logger;

const RING_REPLICAS: usize = 100;
/// Load bound factor for the `bounded` algorithm.
const BOUND_FACTOR: f64 = 1.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    RoundRobin,
    Random,
    IpHash,
    ConsistentHash,
    P2c,
    LeastLoad,
    Bounded,
}

impl Algorithm {
    fn parse(s: &str) -> FasthttpdResult<Self> {
        match s {
            "" | "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "ip-hash" => Ok(Self::IpHash),
            "consistent-hash" => Ok(Self::ConsistentHash),
            "p2c" => Ok(Self::P2c),
            "least-load" => Ok(Self::LeastLoad),
            "bounded" => Ok(Self::Bounded),
            _ => Err(FasthttpdError::handler(format!(
                "failed to create balancer: unknown algorithm: {}",
                s
            ))),
        }
    }
}

#[derive(Debug)]
struct Target {
    upstream: Uri,
    /// host:port used by the health-check probe.
    authority: String,
    healthy: AtomicBool,
    active: AtomicU64,
}

/// Distributes requests over several backend URLs.
///
/// Supported algorithms: round-robin, random, ip-hash, consistent-hash,
/// p2c, least-load, bounded. An optional TCP connect probe marks targets
/// unhealthy between requests.
#[derive(Debug)]
pub struct BalancerHandler {
    targets: Arc<Vec<Target>>,
    algorithm: Algorithm,
    counter: AtomicUsize,
    /// (hash, target index) pairs sorted by hash.
    ring: Vec<(u64, usize)>,
    client: UpstreamClient,
    logger: Logger,
}

fn balancer_urls(cfg: &Value) -> FasthttpdResult<Vec<String>> {
    if let Some(Value::Sequence(seq)) = cfg.get("urls") {
        let urls: Vec<String> = seq
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !urls.is_empty() {
            return Ok(urls);
        }
    }
    if let Some(url) = cfg.get("url").and_then(Value::as_str) {
        if !url.is_empty() {
            return Ok(vec![url.to_string()]);
        }
    }
    Err(FasthttpdError::handler(
        "failed to create balancer: require 'url' or 'urls' entry",
    ))
}

impl BalancerHandler {
    pub fn new(cfg: &Value, logger: Logger) -> FasthttpdResult<Self> {
        let urls = balancer_urls(cfg)?;
        let algorithm = Algorithm::parse(
            cfg.get("algorithm")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )?;

        let mut targets = Vec::with_capacity(urls.len());
        for url in &urls {
            let upstream: Uri = url.parse()?;
            let authority = match upstream.authority() {
                Some(a) => {
                    let port = upstream.port_u16().unwrap_or(match upstream.scheme_str() {
                        Some("https") => 443,
                        _ => 80,
                    });
                    format!("{}:{}", a.host(), port)
                }
                None => {
                    return Err(FasthttpdError::handler(format!(
                        "failed to create balancer: invalid url: {}",
                        url
                    )))
                }
            };
            targets.push(Target {
                upstream,
                authority,
                healthy: AtomicBool::new(true),
                active: AtomicU64::new(0),
            });
        }

        let mut ring: Vec<(u64, usize)> = Vec::with_capacity(targets.len() * RING_REPLICAS);
        for (i, url) in urls.iter().enumerate() {
            for replica in 0..RING_REPLICAS {
                ring.push((cache_key_str(&format!("{}#{}", url, replica)), i));
            }
        }
        ring.sort_unstable();

        let handler = Self {
            targets: Arc::new(targets),
            algorithm,
            counter: AtomicUsize::new(0),
            ring,
            client: upstream_client(),
            logger,
        };

        let interval = cfg
            .get("healthCheckInterval")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if interval > 0 {
            handler.spawn_health_check(Duration::from_secs(interval));
        }
        Ok(handler)
    }

    fn spawn_health_check(&self, interval: Duration) {
        let targets = Arc::clone(&self.targets);
        let logger = self.logger.clone();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return,
        };
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for target in targets.iter() {
                    let alive = tokio::time::timeout(
                        Duration::from_secs(5),
                        tokio::net::TcpStream::connect(&target.authority),
                    )
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                    let was = target.healthy.swap(alive, Ordering::Relaxed);
                    if was != alive {
                        logger.printf(&format!(
                            "balancer: target {} is now {}",
                            target.authority,
                            if alive { "healthy" } else { "unhealthy" }
                        ));
                    }
                }
            }
        });
    }

    fn alive(&self) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.healthy.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .collect()
    }

    fn pick(&self, client_key: &str) -> Option<usize> {
        let alive = self.alive();
        if alive.is_empty() {
            return None;
        }
        let chosen = match self.algorithm {
            Algorithm::RoundRobin => {
                alive[self.counter.fetch_add(1, Ordering::Relaxed) % alive.len()]
            }
            Algorithm::Random => alive[rand::thread_rng().gen_range(0..alive.len())],
            Algorithm::IpHash => alive[(cache_key_str(client_key) as usize) % alive.len()],
            Algorithm::LeastLoad => *alive
                .iter()
                .min_by_key(|&&i| self.targets[i].active.load(Ordering::Relaxed))?,
            Algorithm::P2c => {
                let mut rng = rand::thread_rng();
                let a = alive[rng.gen_range(0..alive.len())];
                let b = alive[rng.gen_range(0..alive.len())];
                if self.targets[a].active.load(Ordering::Relaxed)
                    <= self.targets[b].active.load(Ordering::Relaxed)
                {
                    a
                } else {
                    b
                }
            }
            Algorithm::ConsistentHash => self.ring_pick(client_key, &alive, None)?,
            Algorithm::Bounded => {
                let total: u64 = alive
                    .iter()
                    .map(|&i| self.targets[i].active.load(Ordering::Relaxed))
                    .sum();
                let bound = (BOUND_FACTOR * (total + 1) as f64 / alive.len() as f64).ceil() as u64;
                self.ring_pick(client_key, &alive, Some(bound))?
            }
        };
        Some(chosen)
    }

    /// Walks the hash ring from the client key, skipping dead targets and,
    /// when a load bound is given, targets already at the bound.
    fn ring_pick(&self, client_key: &str, alive: &[usize], bound: Option<u64>) -> Option<usize> {
        if self.ring.is_empty() {
            return None;
        }
        let key = cache_key_str(client_key);
        let start = self.ring.partition_point(|&(h, _)| h < key);
        for step in 0..self.ring.len() {
            let (_, i) = self.ring[(start + step) % self.ring.len()];
            if !alive.contains(&i) {
                continue;
            }
            if let Some(bound) = bound {
                if self.targets[i].active.load(Ordering::Relaxed) + 1 > bound {
                    continue;
                }
            }
            return Some(i);
        }
        // Every candidate is at the bound; fall back to the least loaded.
        alive
            .iter()
            .min_by_key(|&&i| self.targets[i].active.load(Ordering::Relaxed))
            .copied()
    }
}

#[async_trait]
impl Handler for BalancerHandler {
    async fn handle(&self, ctx: &mut RequestCtx) {
        let client_key = ctx.remote_addr.ip().to_string();
        let i = match self.pick(&client_key) {
            Some(i) => i,
            None => {
                self.logger.printf("balancer: no healthy targets");
                ctx.reset_response();
                ctx.set_status(503);
                return;
            }
        };
        let target = &self.targets[i];
        target.active.fetch_add(1, Ordering::Relaxed);
        let result = forward(&self.client, &target.upstream, ctx).await;
        target.active.fetch_sub(1, Ordering::Relaxed);
        if let Err(err) = result {
            self.logger.printf(&format!(
                "balancer: upstream {} failed: {}",
                target.upstream, err
            ));
            ctx.reset_response();
            ctx.set_status(502);
        }
    }
}

pub fn new_balancer_handler(cfg: &Value, logger: &Logger) -> FasthttpdResult<Arc<dyn Handler>> {
    Ok(Arc::new(BalancerHandler::new(cfg, logger.clone())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(yaml: &str) -> BalancerHandler {
        BalancerHandler::new(&serde_yaml::from_str(yaml).unwrap(), Logger::nil()).unwrap()
    }

    fn three_targets(algorithm: &str) -> BalancerHandler {
        balancer(&format!(
            "{{type: balancer, algorithm: {}, urls: ['http://a:1', 'http://b:2', 'http://c:3']}}",
            algorithm
        ))
    }

    #[test]
    fn test_requires_urls() {
        let cfg: Value = serde_yaml::from_str("type: balancer").unwrap();
        let err = BalancerHandler::new(&cfg, Logger::nil()).unwrap_err();
        assert!(err.to_string().contains("require 'url' or 'urls' entry"));
    }

    #[test]
    fn test_single_url_form() {
        let b = balancer("{type: balancer, url: 'http://a:1'}");
        assert_eq!(b.targets.len(), 1);
        assert_eq!(b.pick("10.0.0.1"), Some(0));
    }

    #[test]
    fn test_unknown_algorithm() {
        let cfg: Value =
            serde_yaml::from_str("{type: balancer, url: 'http://a:1', algorithm: fancy}").unwrap();
        let err = BalancerHandler::new(&cfg, Logger::nil()).unwrap_err();
        assert!(err.to_string().contains("unknown algorithm: fancy"));
    }

    #[test]
    fn test_round_robin_cycles() {
        let b = three_targets("round-robin");
        let picks: Vec<usize> = (0..6).map(|_| b.pick("x").unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let b = three_targets("round-robin");
        b.targets[1].healthy.store(false, Ordering::Relaxed);
        let picks: Vec<usize> = (0..4).map(|_| b.pick("x").unwrap()).collect();
        assert_eq!(picks, vec![0, 2, 0, 2]);
    }

    #[test]
    fn test_ip_hash_is_sticky() {
        let b = three_targets("ip-hash");
        let first = b.pick("10.1.2.3").unwrap();
        for _ in 0..10 {
            assert_eq!(b.pick("10.1.2.3").unwrap(), first);
        }
    }

    #[test]
    fn test_consistent_hash_is_sticky_and_survives_failure() {
        let b = three_targets("consistent-hash");
        let first = b.pick("10.1.2.3").unwrap();
        assert_eq!(b.pick("10.1.2.3").unwrap(), first);

        b.targets[first].healthy.store(false, Ordering::Relaxed);
        let next = b.pick("10.1.2.3").unwrap();
        assert_ne!(next, first);
        // Stable again after the failover.
        assert_eq!(b.pick("10.1.2.3").unwrap(), next);
    }

    #[test]
    fn test_least_load_prefers_idle_target() {
        let b = three_targets("least-load");
        b.targets[0].active.store(5, Ordering::Relaxed);
        b.targets[1].active.store(1, Ordering::Relaxed);
        b.targets[2].active.store(9, Ordering::Relaxed);
        assert_eq!(b.pick("x"), Some(1));
    }

    #[test]
    fn test_p2c_picks_lighter_of_two() {
        let b = three_targets("p2c");
        b.targets[0].active.store(100, Ordering::Relaxed);
        b.targets[1].active.store(100, Ordering::Relaxed);
        b.targets[2].active.store(0, Ordering::Relaxed);
        // Over many draws the idle target must win whenever sampled.
        let mut saw_idle = false;
        for _ in 0..64 {
            let pick = b.pick("x").unwrap();
            if pick == 2 {
                saw_idle = true;
            }
        }
        assert!(saw_idle);
    }

    #[test]
    fn test_bounded_spills_over_at_bound() {
        let b = three_targets("bounded");
        let sticky = b.pick("10.9.9.9").unwrap();
        // Saturate the sticky target well past any bound.
        b.targets[sticky].active.store(1000, Ordering::Relaxed);
        let next = b.pick("10.9.9.9").unwrap();
        assert_ne!(next, sticky);
    }

    #[test]
    fn test_no_healthy_targets() {
        let b = three_targets("round-robin");
        for t in b.targets.iter() {
            t.healthy.store(false, Ordering::Relaxed);
        }
        assert_eq!(b.pick("x"), None);
    }
}
