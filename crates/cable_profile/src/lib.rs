#![forbid(unsafe_code)]

//! Process-wide registry of named timing regions. Callers hold a guard for
//! the duration of a region; accumulated totals are drained once at the end
//! of a run. With the `measure` feature disabled every call is a no-op, so
//! instrumented code carries no cost in production builds.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionStats {
    pub name: &'static str,
    pub count: u64,
    pub total: Duration,
}

#[cfg(feature = "measure")]
mod imp {
    use super::RegionStats;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};
    use std::time::{Duration, Instant};

    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, (u64, Duration)>>> = OnceLock::new();

    fn registry() -> &'static Mutex<HashMap<&'static str, (u64, Duration)>> {
        REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub struct RegionGuard {
        name: &'static str,
        start: Instant,
    }

    impl Drop for RegionGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            let mut map = match registry().lock() {
                Ok(map) => map,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = map.entry(self.name).or_insert((0, Duration::ZERO));
            entry.0 += 1;
            entry.1 += elapsed;
        }
    }

    pub fn region(name: &'static str) -> RegionGuard {
        RegionGuard {
            name,
            start: Instant::now(),
        }
    }

    pub fn drain() -> Vec<RegionStats> {
        let mut map = match registry().lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut stats: Vec<RegionStats> = map
            .drain()
            .map(|(name, (count, total))| RegionStats { name, count, total })
            .collect();
        stats.sort_by_key(|s| s.name);
        stats
    }
}

#[cfg(not(feature = "measure"))]
mod imp {
    use super::RegionStats;

    pub struct RegionGuard;

    pub fn region(_name: &'static str) -> RegionGuard {
        RegionGuard
    }

    pub fn drain() -> Vec<RegionStats> {
        Vec::new()
    }
}

pub use imp::{drain, region, RegionGuard};
