// ABOUTME: Built-in addons and the catalog that gates directory discovery
// ABOUTME: A directory sq_<name> only loads when <name> has a factory here

pub mod chat_bridge;
pub mod ping;
pub mod redeem_alerts;
pub mod timers;

use squawk_core::AddonCatalog;

/// Every addon the binary can build. Discovery only honors names listed
/// here; an sq_* directory without a matching entry is skipped with a
/// warning. The chat bridge is not listed because it is always on.
pub fn catalog() -> AddonCatalog {
    let mut catalog = AddonCatalog::new();
    catalog.add("ping", ping::build);
    catalog.add("timers", timers::build);
    catalog.add("redeem_alerts", redeem_alerts::build);
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_contents() {
        let catalog = catalog();
        assert_eq!(catalog.names(), vec!["ping", "redeem_alerts", "timers"]);
    }
}
