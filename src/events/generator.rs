//! Typed market event generation.
//!
//! Each tick (while the market is open) a black-swan roll runs first, then
//! every company rolls against the base event chance and samples a template
//! permitted for its sector.

use lazy_static::lazy_static;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use crate::models::{Company, EventType, MarketEvent, Sector};

pub struct EventTemplate {
    pub event_type: EventType,
    /// Empty slice = any sector.
    pub sectors: &'static [Sector],
    pub impact_range: (f64, f64),
    pub duration_range: (i64, i64),
    pub headlines: &'static [&'static str],
}

impl EventTemplate {
    fn permits(&self, sector: Sector) -> bool {
        self.sectors.is_empty() || self.sectors.contains(&sector)
    }
}

lazy_static! {
    static ref COMPANY_TEMPLATES: Vec<EventTemplate> = vec![
        EventTemplate {
            event_type: EventType::EarningsBeat,
            sectors: &[],
            impact_range: (0.03, 0.12),
            duration_range: (5, 20),
            headlines: &[
                "{company} crushes earnings expectations",
                "{symbol} posts blowout quarter",
                "{company} beats on top and bottom line",
            ],
        },
        EventTemplate {
            event_type: EventType::EarningsMiss,
            sectors: &[],
            impact_range: (-0.12, -0.03),
            duration_range: (5, 20),
            headlines: &[
                "{company} misses earnings badly",
                "{symbol} guidance disappoints analysts",
                "{company} quarter falls short of estimates",
            ],
        },
        EventTemplate {
            event_type: EventType::FdaApproval,
            sectors: &[Sector::Healthcare],
            impact_range: (0.08, 0.25),
            duration_range: (10, 30),
            headlines: &[
                "FDA approves {company} flagship treatment",
                "{symbol} wins landmark FDA approval",
            ],
        },
        EventTemplate {
            event_type: EventType::FdaRejection,
            sectors: &[Sector::Healthcare],
            impact_range: (-0.25, -0.08),
            duration_range: (10, 30),
            headlines: &[
                "FDA rejects {company} drug application",
                "{symbol} stumbles on FDA setback",
            ],
        },
        EventTemplate {
            event_type: EventType::ProductLaunch,
            sectors: &[Sector::Technology, Sector::Consumer, Sector::Media],
            impact_range: (0.02, 0.10),
            duration_range: (5, 15),
            headlines: &[
                "{company} unveils next-generation product line",
                "{symbol} launch draws record preorders",
            ],
        },
        EventTemplate {
            event_type: EventType::Scandal,
            sectors: &[],
            impact_range: (-0.20, -0.05),
            duration_range: (10, 40),
            headlines: &[
                "{company} rocked by executive scandal",
                "Whistleblower allegations surface at {symbol}",
            ],
        },
        EventTemplate {
            event_type: EventType::MergerRumor,
            sectors: &[],
            impact_range: (0.04, 0.15),
            duration_range: (5, 25),
            headlines: &[
                "{company} said to explore merger talks",
                "Deal chatter lifts {symbol}",
            ],
        },
        EventTemplate {
            event_type: EventType::SectorBoom,
            sectors: &[],
            impact_range: (0.03, 0.10),
            duration_range: (10, 30),
            headlines: &[
                "Investors pile into the {sector} sector",
                "{sector} names rally on sector-wide optimism",
            ],
        },
        EventTemplate {
            event_type: EventType::SectorBust,
            sectors: &[],
            impact_range: (-0.10, -0.03),
            duration_range: (10, 30),
            headlines: &[
                "Rout spreads across the {sector} sector",
                "{sector} stocks slide on sector-wide fears",
            ],
        },
        EventTemplate {
            event_type: EventType::MemePump,
            sectors: &[Sector::Technology, Sector::Crypto, Sector::Media],
            impact_range: (0.05, 0.30),
            duration_range: (3, 10),
            headlines: &[
                "Retail frenzy sends {symbol} vertical",
                "{symbol} goes viral as meme traders swarm",
            ],
        },
        EventTemplate {
            event_type: EventType::ShortSqueeze,
            sectors: &[],
            impact_range: (0.05, 0.25),
            duration_range: (3, 12),
            headlines: &[
                "Shorts scramble to cover {symbol}",
                "{company} squeeze catches bears off guard",
            ],
        },
    ];
    static ref MARKET_TEMPLATES: Vec<EventTemplate> = vec![
        EventTemplate {
            event_type: EventType::BlackSwan,
            sectors: &[],
            impact_range: (-0.30, -0.12),
            duration_range: (20, 60),
            headlines: &[
                "Markets reel as black swan event unfolds",
                "Panic selling grips the market",
            ],
        },
        EventTemplate {
            event_type: EventType::MarketCrash,
            sectors: &[],
            impact_range: (-0.25, -0.10),
            duration_range: (15, 50),
            headlines: &[
                "Stocks crater in broad market crash",
                "Circuit breakers loom as indices plunge",
            ],
        },
        EventTemplate {
            event_type: EventType::MarketRally,
            sectors: &[],
            impact_range: (0.08, 0.20),
            duration_range: (10, 40),
            headlines: &[
                "Everything rally lifts all boats",
                "Broad market surge catches skeptics flat-footed",
            ],
        },
    ];
}

fn render_headline(template: &str, company: Option<&Company>, sector: Option<Sector>) -> String {
    let mut out = template.to_string();
    if let Some(c) = company {
        out = out.replace("{company}", &c.name).replace("{symbol}", &c.symbol);
    }
    if let Some(s) = sector {
        out = out.replace("{sector}", s.as_str());
    }
    out
}

pub struct EventGenerator {
    pub black_swan_chance: f64,
    pub base_event_chance: f64,
}

impl EventGenerator {
    pub fn new(black_swan_chance: f64, base_event_chance: f64) -> Self {
        Self {
            black_swan_chance,
            base_event_chance,
        }
    }

    fn sample(
        template: &EventTemplate,
        company: Option<&Company>,
        tick: i64,
        rng: &mut ChaCha8Rng,
    ) -> MarketEvent {
        let (lo, hi) = template.impact_range;
        let impact = rng.gen_range(lo..hi);
        let (dlo, dhi) = template.duration_range;
        let duration = rng.gen_range(dlo..=dhi);
        let headline_template = template.headlines[rng.gen_range(0..template.headlines.len())];
        let sector = company.map(|c| c.sector);

        let sector_scoped = matches!(
            template.event_type,
            EventType::SectorBoom | EventType::SectorBust
        );

        MarketEvent {
            id: Uuid::new_v4().to_string(),
            event_type: template.event_type,
            // Sector events hit the whole sector rather than one ticker.
            symbol: if sector_scoped || template.event_type.is_market_wide() {
                None
            } else {
                company.map(|c| c.symbol.clone())
            },
            sector: if template.event_type.is_market_wide() {
                None
            } else {
                sector
            },
            impact,
            duration_ticks: duration,
            origin_tick: tick,
            headline: render_headline(headline_template, company, sector),
        }
    }

    /// Roll this tick's random events.
    pub fn generate(
        &self,
        tick: i64,
        companies: &[&Company],
        rng: &mut ChaCha8Rng,
    ) -> Vec<MarketEvent> {
        let mut events = Vec::new();

        if rng.gen::<f64>() < self.black_swan_chance {
            let template = &MARKET_TEMPLATES[rng.gen_range(0..MARKET_TEMPLATES.len())];
            events.push(Self::sample(template, None, tick, rng));
        }

        for &company in companies {
            if rng.gen::<f64>() >= self.base_event_chance {
                continue;
            }
            let permitted: Vec<&EventTemplate> = COMPANY_TEMPLATES
                .iter()
                .filter(|t| t.permits(company.sector))
                .collect();
            if permitted.is_empty() {
                continue;
            }
            let template = permitted[rng.gen_range(0..permitted.len())];
            events.push(Self::sample(template, Some(company), tick, rng));
        }

        events
    }

    /// A rumor planted by an agent: bounded impact, short lived.
    pub fn rumor(
        tick: i64,
        company: &Company,
        positive: bool,
        rng: &mut ChaCha8Rng,
    ) -> MarketEvent {
        let magnitude = rng.gen_range(0.01..0.05);
        let impact = if positive { magnitude } else { -magnitude };
        let headline = if positive {
            format!("Rumor mill buzzes with {} takeover talk", company.name)
        } else {
            format!("Unverified trouble rumored at {}", company.name)
        };
        MarketEvent {
            id: Uuid::new_v4().to_string(),
            event_type: EventType::MergerRumor,
            symbol: Some(company.symbol.clone()),
            sector: Some(company.sector),
            impact,
            duration_ticks: rng.gen_range(3..=8),
            origin_tick: tick,
            headline,
        }
    }
}
