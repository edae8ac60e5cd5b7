#[derive(Debug, Clone)]
pub struct Config {
    /// Degree at which a node switches from a single relationship chain to
    /// per-type relationship groups.
    pub dense_node_threshold: u32,
    pub read_only: bool,
    /// Run the consistency checking applier ahead of every store write.
    pub consistency_check_on_apply: bool,
    /// Keep degrees of dense chains in the group-degrees store instead of the
    /// chain head record.
    pub relaxed_locking_for_dense_nodes: bool,
    /// Let the first write after a runtime version bump commit the upgrade
    /// transaction automatically.
    pub allow_single_automatic_upgrade: bool,
    pub page_cache_pages: usize,
    /// Bounded wait for the exclusive upgrade lock before the upgrade is
    /// deferred to the next write.
    pub upgrade_lock_timeout_ms: u64,
    /// Cross-check every mutated record against the locks the committing
    /// transaction holds.
    pub lock_verification: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dense_node_threshold: 50,
            read_only: false,
            consistency_check_on_apply: false,
            relaxed_locking_for_dense_nodes: false,
            allow_single_automatic_upgrade: true,
            page_cache_pages: 1024,
            upgrade_lock_timeout_ms: 100,
            lock_verification: false,
        }
    }
}

impl Config {
    /// Every optional verification enabled. Slow; meant for tests and
    /// consistency investigations.
    pub fn strict() -> Self {
        Self {
            consistency_check_on_apply: true,
            lock_verification: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }
}
