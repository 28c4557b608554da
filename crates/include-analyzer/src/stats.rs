//! Request counters, reported through `tracing` when the data-debug bit is
//! set.

use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub find_node_count: u64,
    pub master_hit_count: u64,
    pub master_miss_count: u64,
    pub parse_file_count: u64,
    pub resolve_expr_count: u64,
    pub quote_path_total: u64,
    pub angle_path_total: u64,
    /// Closure entries emitted, and nodes visited outside systemdirs.
    pub closure_len: usize,
    pub closure_nonsys_len: usize,
}

impl Stats {
    pub fn log_summary(&self, stat_count: u64, probe_count: u64) {
        debug!(
            find_node = self.find_node_count,
            hits = self.master_hit_count,
            misses = self.master_miss_count,
            parsed_files = self.parse_file_count,
            resolved_exprs = self.resolve_expr_count,
            stat_calls = stat_count,
            cache_probes = probe_count,
            closure = self.closure_len,
            closure_nonsys = self.closure_nonsys_len,
            "request counters"
        );
    }
}
