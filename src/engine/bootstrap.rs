//! First-boot seeding: a default company universe and the reserved
//! market-maker agent. No-ops when the store already has companies.

use anyhow::Result;
use tracing::info;

use crate::market::maker::MARKET_MAKER_AGENT_ID;
use crate::models::{Agent, Company, Sector};
use crate::store::EngineStore;

fn default_universe() -> Vec<Company> {
    vec![
        Company::new("AAPL", "Apple Inc.", Sector::Technology, 150.00, 16_000_000, 0.25, 1.1),
        Company::new("MSFT", "Microsoft Corp.", Sector::Technology, 320.00, 7_400_000, 0.22, 0.9),
        Company::new("NVDA", "Nvidia Corp.", Sector::Technology, 480.00, 2_500_000, 0.45, 1.6),
        Company::new("JPM", "JPMorgan Chase", Sector::Finance, 145.00, 2_900_000, 0.20, 1.1),
        Company::new("GS", "Goldman Sachs", Sector::Finance, 340.00, 330_000, 0.28, 1.3),
        Company::new("PFE", "Pfizer Inc.", Sector::Healthcare, 38.00, 5_600_000, 0.24, 0.7),
        Company::new("MRNA", "Moderna Inc.", Sector::Healthcare, 110.00, 380_000, 0.55, 1.4),
        Company::new("XOM", "Exxon Mobil", Sector::Energy, 105.00, 4_000_000, 0.26, 0.9),
        Company::new("WMT", "Walmart Inc.", Sector::Consumer, 160.00, 2_700_000, 0.15, 0.5),
        Company::new("CAT", "Caterpillar Inc.", Sector::Industrial, 260.00, 510_000, 0.23, 1.0),
        Company::new("DIS", "Walt Disney Co.", Sector::Media, 92.00, 1_800_000, 0.27, 1.2),
        Company::new("COIN", "Coinbase Global", Sector::Crypto, 85.00, 230_000, 0.70, 1.9),
    ]
}

/// Seed companies and the market-maker agent on an empty store. Returns the
/// number of companies inserted (0 when already seeded).
pub fn seed_universe(store: &EngineStore) -> Result<usize> {
    if store.get_agent(MARKET_MAKER_AGENT_ID)?.is_none() {
        let mut maker = Agent::new(MARKET_MAKER_AGENT_ID, "Market Maker", 1_000_000_000.0);
        maker.role = "market_maker".to_string();
        store.upsert_agent(&maker)?;
    }

    let existing = store.list_companies()?;
    if !existing.is_empty() {
        return Ok(0);
    }

    let universe = default_universe();
    for company in &universe {
        store.upsert_company(company)?;
    }
    info!(companies = universe.len(), "seeded default company universe");
    Ok(universe.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_idempotent() {
        let store = EngineStore::open_in_memory().unwrap();
        let first = seed_universe(&store).unwrap();
        assert!(first > 0);
        assert_eq!(seed_universe(&store).unwrap(), 0);

        let companies = store.list_companies().unwrap();
        assert_eq!(companies.len(), first);
        assert!(store.get_agent(MARKET_MAKER_AGENT_ID).unwrap().is_some());
    }

    #[test]
    fn universe_covers_every_sector() {
        let sectors: std::collections::HashSet<Sector> =
            default_universe().iter().map(|c| c.sector).collect();
        for sector in Sector::ALL {
            assert!(sectors.contains(&sector), "missing {sector:?}");
        }
    }
}
