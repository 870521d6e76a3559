use std::env;
use std::sync::OnceLock;

static NNRT_PASS_STATS: OnceLock<bool> = OnceLock::new();
static NNRT_DISABLE_MEMORY_REUSE: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

pub(crate) fn pass_stats_enabled() -> bool {
    flag(&NNRT_PASS_STATS, "NNRT_PASS_STATS")
}

pub(crate) fn memory_reuse_disabled() -> bool {
    flag(&NNRT_DISABLE_MEMORY_REUSE, "NNRT_DISABLE_MEMORY_REUSE")
}
