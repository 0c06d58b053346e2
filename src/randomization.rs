use chrono::{DateTime, FixedOffset, Offset, Utc};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Beta, LogNormal};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RandomizationError;
use crate::types::ClusterIndex;

/// Countries that produce no usable timezone are re-drawn at most this many times.
const MAX_COUNTRY_REDRAWS: usize = 32;

/// Every decision in a run is drawn from one of these. A cluster owns exactly
/// one, derived from the run seed and the cluster index.
#[derive(Debug, Clone)]
pub struct RandomStream {
    rng: ChaCha20Rng,
}

impl RandomStream {
    pub fn from_seed(seed: &str) -> Self {
        RandomStream { rng: ChaCha20Rng::seed_from_u64(fold_seed(seed)) }
    }

    /// Independent sub-stream for one cluster: same key, ChaCha stream = cluster index.
    pub fn for_cluster(seed: &str, cluster: ClusterIndex) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(fold_seed(seed));
        rng.set_stream(cluster.0 as u64);
        RandomStream { rng }
    }

    /// Fresh seed from OS entropy, for runs started without one.
    pub fn generate_seed() -> String {
        let mut rng = rand::rng();
        format!("{:016x}", rng.random::<u64>())
    }

    // ── Numeric helpers ───────────────────────────────────────────────────────

    /// Uniform in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.random::<f64>()
    }

    /// Uniform in [lo, hi). Returns `lo` when the range is empty.
    pub fn uniform_range(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.random_range(lo..hi)
    }

    /// Integer uniform in [lo, hi]. Returns `lo` when `hi < lo`.
    pub fn int_inclusive(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        self.rng.random_range(lo..=hi)
    }

    pub fn beta(&mut self, alpha: f64, beta: f64) -> f64 {
        let dist = Beta::new(alpha, beta).expect("invalid Beta params");
        dist.sample(&mut self.rng)
    }

    /// Log-normal in ln-space params; E[X] = exp(mu + sigma²/2).
    pub fn lognormal(&mut self, mu: f64, sigma: f64) -> f64 {
        let dist = LogNormal::new(mu, sigma).expect("invalid LogNormal params");
        dist.sample(&mut self.rng)
    }

    /// `true` with probability `p` (clamped to [0, 1]).
    pub fn chance(&mut self, p: f64) -> bool {
        let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        self.rng.random_bool(p)
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.rng)
    }

    /// Pick one element of `population` with probability proportional to `weights`.
    pub fn weighted_choice<'a, T>(
        &mut self,
        population: &'a [T],
        weights: &[f64],
    ) -> Result<&'a T, RandomizationError> {
        if population.len() != weights.len() {
            return Err(RandomizationError::LengthMismatch {
                population: population.len(),
                weights: weights.len(),
            });
        }
        let index = WeightedIndex::new(weights)
            .map_err(|e| RandomizationError::InvalidWeights(e.to_string()))?;
        Ok(&population[index.sample(&mut self.rng)])
    }

    /// UUIDv7-layout id: the millisecond timestamp of `at` plus 10 bytes from the stream.
    pub fn roll_uuidt(&mut self, at: DateTime<Utc>) -> Uuid {
        let mut random_bytes = [0u8; 10];
        self.rng.fill(&mut random_bytes);
        let millis = at.timestamp_millis().max(0) as u64;
        uuid::Builder::from_unix_timestamp_millis(millis, &random_bytes).into_uuid()
    }

    // ── Domain generators ─────────────────────────────────────────────────────

    pub fn first_name(&mut self) -> &'static str {
        self.pick(FIRST_NAMES)
    }

    pub fn last_name(&mut self) -> &'static str {
        self.pick(LAST_NAMES)
    }

    pub fn full_name(&mut self) -> String {
        format!("{} {}", self.first_name(), self.last_name())
    }

    /// Email derived from a full name. Without a company domain a free-mail domain is used.
    pub fn email(&mut self, full_name: &str, domain: Option<&str>) -> String {
        let local: String = full_name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(".")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '.')
            .collect();
        match domain {
            // Company addresses are sometimes first-name only.
            Some(domain) if self.chance(0.3) => {
                let first = local.split('.').next().unwrap_or("team");
                format!("{first}@{domain}")
            }
            Some(domain) => format!("{local}@{domain}"),
            None => {
                let domain = self.pick(FREEMAIL_DOMAINS);
                format!("{local}{}@{domain}", self.int_inclusive(0, 99))
            }
        }
    }

    pub fn company(&mut self) -> Company {
        let name = format!("{} {}", self.pick(COMPANY_STEMS), self.pick(COMPANY_SUFFIXES));
        let domain = format!(
            "{}.{}",
            name.split_whitespace()
                .next()
                .unwrap_or("company")
                .to_lowercase(),
            self.pick(&["com", "io", "co", "dev"])
        );
        let industry = self.pick(INDUSTRIES).to_string();
        Company { name, domain, industry }
    }

    /// Country, city and street, re-drawing countries that have no known timezone.
    pub fn address(&mut self) -> Address {
        for _ in 0..MAX_COUNTRY_REDRAWS {
            let country = self.pick_weighted(COUNTRIES, |c| c.weight);
            let Some(&(city, offset_minutes)) = country.cities.choose(&mut self.rng) else {
                continue;
            };
            let Some(offset) = FixedOffset::east_opt(offset_minutes * 60) else {
                continue;
            };
            let street = format!(
                "{} {} {}",
                self.int_inclusive(1, 999),
                self.pick(STREET_NAMES),
                self.pick(STREET_SUFFIXES)
            );
            return Address {
                country_code: country.code,
                country_name: country.name,
                city,
                street,
                utc_offset: offset,
            };
        }
        Address {
            country_code: "GB",
            country_name: "United Kingdom",
            city: "London",
            street: "1 High Street".to_string(),
            utc_offset: Utc.fix(),
        }
    }

    pub fn device(&mut self) -> Device {
        let combo = self.pick_weighted(DEVICE_COMBOS, |c| c.weight);
        let (width, height) = self.pick(match combo.device_type {
            "Mobile" => MOBILE_SCREENS,
            _ => DESKTOP_SCREENS,
        });
        Device {
            device_type: combo.device_type,
            os: combo.os,
            browser: combo.browser,
            screen_width: width,
            screen_height: height,
        }
    }

    pub fn file(&mut self) -> FileMetadata {
        let kind = self.pick_weighted(FILE_KINDS, |k| k.weight);
        let size_b = self.lognormal(kind.size_mu, kind.size_sigma).max(1.0) as u64;
        let name = format!(
            "{}-{}.{}",
            self.pick(FILE_WORDS),
            self.int_inclusive(1, 400),
            kind.extension
        );
        FileMetadata { name, mime_type: kind.mime_type, size_b }
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> T {
        items[self.rng.random_range(0..items.len())]
    }

    /// Weighted pick over a non-empty constant table.
    fn pick_weighted<'a, T>(&mut self, items: &'a [T], weight: impl Fn(&T) -> f64) -> &'a T {
        items.choose_weighted(&mut self.rng, weight).expect("invalid table weights")
    }
}


/// FNV-1a fold of the seed string; `seed_from_u64` expands it to a ChaCha key.
fn fold_seed(seed: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in seed.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

// ── Generated value types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Company {
    pub name: String,
    pub domain: String,
    pub industry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub country_code: &'static str,
    pub country_name: &'static str,
    pub city: &'static str,
    pub street: String,
    #[serde(serialize_with = "serialize_offset")]
    pub utc_offset: FixedOffset,
}

fn serialize_offset<S: serde::Serializer>(offset: &FixedOffset, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&offset.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Device {
    pub device_type: &'static str,
    pub os: &'static str,
    pub browser: &'static str,
    pub screen_width: u32,
    pub screen_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub mime_type: &'static str,
    pub size_b: u64,
}

// ── Tables ────────────────────────────────────────────────────────────────────

struct CountryInfo {
    code: &'static str,
    name: &'static str,
    weight: f64,
    /// (city, UTC offset in minutes). Empty means no known timezone.
    cities: &'static [(&'static str, i32)],
}

const COUNTRIES: &[CountryInfo] = &[
    CountryInfo {
        code: "US",
        name: "United States",
        weight: 40.0,
        cities: &[
            ("New York", -300),
            ("Chicago", -360),
            ("Austin", -360),
            ("Denver", -420),
            ("San Francisco", -480),
            ("Seattle", -480),
        ],
    },
    CountryInfo {
        code: "GB",
        name: "United Kingdom",
        weight: 10.0,
        cities: &[("London", 0), ("Manchester", 0), ("Bristol", 0)],
    },
    CountryInfo {
        code: "DE",
        name: "Germany",
        weight: 8.0,
        cities: &[("Berlin", 60), ("Munich", 60), ("Hamburg", 60)],
    },
    CountryInfo { code: "FR", name: "France", weight: 6.0, cities: &[("Paris", 60), ("Lyon", 60)] },
    CountryInfo { code: "PL", name: "Poland", weight: 5.0, cities: &[("Warsaw", 60), ("Kraków", 60)] },
    CountryInfo {
        code: "IN",
        name: "India",
        weight: 9.0,
        cities: &[("Bengaluru", 330), ("Mumbai", 330), ("Pune", 330)],
    },
    CountryInfo {
        code: "BR",
        name: "Brazil",
        weight: 6.0,
        cities: &[("São Paulo", -180), ("Rio de Janeiro", -180)],
    },
    CountryInfo { code: "JP", name: "Japan", weight: 5.0, cities: &[("Tokyo", 540), ("Osaka", 540)] },
    CountryInfo {
        code: "AU",
        name: "Australia",
        weight: 4.0,
        cities: &[("Sydney", 600), ("Melbourne", 600), ("Perth", 480)],
    },
    CountryInfo {
        code: "CA",
        name: "Canada",
        weight: 5.0,
        cities: &[("Toronto", -300), ("Montreal", -300), ("Vancouver", -480)],
    },
    CountryInfo { code: "AQ", name: "Antarctica", weight: 1.0, cities: &[] },
];

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Amara", "Ben", "Chloe", "Daniel", "Elena", "Farah", "Felix", "Grace", "Hana",
    "Igor", "Isla", "Jamal", "Julia", "Kenji", "Lena", "Liam", "Maya", "Mateo", "Nadia", "Noah",
    "Olga", "Omar", "Priya", "Quinn", "Rosa", "Sven", "Tara", "Victor", "Wen", "Zoe",
];

const LAST_NAMES: &[&str] = &[
    "Anderson", "Bauer", "Chen", "Dubois", "Evans", "Fischer", "García", "Hughes", "Ito",
    "Jansen", "Kowalski", "Larsen", "Martin", "Nakamura", "Novak", "Okafor", "Patel", "Quispe",
    "Rossi", "Silva", "Schmidt", "Tanaka", "Usman", "Varga", "Walsh", "Xu", "Yilmaz", "Zieliński",
];

const FREEMAIL_DOMAINS: &[&str] = &["gmail.com", "outlook.com", "proton.me", "yahoo.com"];

const COMPANY_STEMS: &[&str] = &[
    "Nimbus", "Orbit", "Granite", "Lumen", "Harbor", "Vertex", "Juniper", "Cobalt", "Meridian",
    "Pioneer", "Sable", "Tundra", "Aurora", "Brightline", "Keystone", "Willow",
];

const COMPANY_SUFFIXES: &[&str] =
    &["Labs", "Systems", "Group", "Works", "Technologies", "Partners", "Studio", "Logistics"];

const INDUSTRIES: &[&str] = &[
    "Software", "Healthcare", "Education", "Finance", "Media", "Manufacturing", "Retail",
    "Architecture", "Legal", "Non-profit",
];

const STREET_NAMES: &[&str] =
    &["Oak", "Maple", "Station", "Church", "Mill", "Park", "River", "Cedar", "King", "Market"];

const STREET_SUFFIXES: &[&str] = &["Street", "Road", "Avenue", "Lane", "Way"];

struct DeviceCombo {
    device_type: &'static str,
    os: &'static str,
    browser: &'static str,
    weight: f64,
}

const DEVICE_COMBOS: &[DeviceCombo] = &[
    DeviceCombo { device_type: "Desktop", os: "Mac OS X", browser: "Chrome", weight: 30.0 },
    DeviceCombo { device_type: "Desktop", os: "Mac OS X", browser: "Safari", weight: 12.0 },
    DeviceCombo { device_type: "Desktop", os: "Windows", browser: "Chrome", weight: 25.0 },
    DeviceCombo { device_type: "Desktop", os: "Windows", browser: "Microsoft Edge", weight: 8.0 },
    DeviceCombo { device_type: "Desktop", os: "Windows", browser: "Firefox", weight: 6.0 },
    DeviceCombo { device_type: "Desktop", os: "Linux", browser: "Firefox", weight: 3.0 },
    DeviceCombo { device_type: "Mobile", os: "iOS", browser: "Mobile Safari", weight: 9.0 },
    DeviceCombo { device_type: "Mobile", os: "Android", browser: "Chrome", weight: 7.0 },
];

const DESKTOP_SCREENS: &[(u32, u32)] = &[(1920, 1080), (1440, 900), (2560, 1440), (1536, 864)];
const MOBILE_SCREENS: &[(u32, u32)] = &[(390, 844), (414, 896), (360, 800)];

struct FileKind {
    mime_type: &'static str,
    extension: &'static str,
    weight: f64,
    /// ln-space size parameters; exp(mu) is the median size in bytes.
    size_mu: f64,
    size_sigma: f64,
}

const FILE_KINDS: &[FileKind] = &[
    FileKind { mime_type: "image/jpeg", extension: "jpg", weight: 30.0, size_mu: 14.5, size_sigma: 0.8 },
    FileKind { mime_type: "image/png", extension: "png", weight: 15.0, size_mu: 13.8, size_sigma: 0.9 },
    FileKind { mime_type: "application/pdf", extension: "pdf", weight: 20.0, size_mu: 13.5, size_sigma: 1.1 },
    FileKind { mime_type: "text/plain", extension: "txt", weight: 8.0, size_mu: 9.0, size_sigma: 1.2 },
    FileKind {
        mime_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        extension: "docx",
        weight: 12.0,
        size_mu: 12.0,
        size_sigma: 0.9,
    },
    FileKind { mime_type: "video/mp4", extension: "mp4", weight: 7.0, size_mu: 18.5, size_sigma: 1.0 },
    FileKind { mime_type: "application/zip", extension: "zip", weight: 8.0, size_mu: 16.5, size_sigma: 1.3 },
];

const FILE_WORDS: &[&str] = &[
    "invoice", "holiday", "report", "draft", "budget", "photo", "slides", "contract", "notes",
    "backup", "receipt", "roadmap", "scan", "demo", "family",
];
