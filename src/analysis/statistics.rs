use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

/// Counters collected while exploring and repairing, for reporting only
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockCacheStatistics {
    pub hits: usize,
    // Hits obtained through aggressive caching, i.e., with another precision
    pub similar_hits: usize,
    pub misses: usize,
    // Cache entries invalidated or created fresh by a repair
    pub recomputes: usize,
    pub repairs: usize,
    pub pair_removals: usize,
    pub repair_time: Duration,
}

impl BlockCacheStatistics {
    pub fn to_json(&self) -> Value {
        json!({
            "hits": self.hits,
            "similar_hits": self.similar_hits,
            "misses": self.misses,
            "recomputes": self.recomputes,
            "repairs": self.repairs,
            "pair_removals": self.pair_removals,
            "repair_time_ms": self.repair_time.as_millis() as u64,
        })
    }
}

impl fmt::Display for BlockCacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache hits:            {}", self.hits)?;
        writeln!(f, "  with other precision: {}", self.similar_hits)?;
        writeln!(f, "Cache misses:          {}", self.misses)?;
        writeln!(f, "Recomputed entries:    {}", self.recomputes)?;
        writeln!(f, "Subtree repairs:       {}", self.repairs)?;
        writeln!(f, "Pairwise removals:     {}", self.pair_removals)?;
        write!(f, "Time for repairs:      {:?}", self.repair_time)
    }
}
