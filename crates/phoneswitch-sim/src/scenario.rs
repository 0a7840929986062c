use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use phoneswitch::types::Capability;

/// One scripted action against a running simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Request {
        id: u64,
        capabilities: Vec<Capability>,
        /// `endpoint:N`, `sub:N` or a bare subscription id.
        #[serde(default)]
        specifier: Option<String>,
        #[serde(default)]
        priority: Option<i32>,
    },
    Release {
        id: u64,
    },
    Allow {
        allowed: bool,
        #[serde(default)]
        timeout_ms: u64,
    },
    Default {
        endpoint: usize,
    },
    SubscriptionReady {
        endpoint: usize,
    },
    SubscriptionLost {
        endpoint: usize,
    },
    ChannelDown {
        endpoint: usize,
    },
    ChannelUp {
        endpoint: usize,
    },
    DropSession {
        endpoint: usize,
    },
    Wait {
        ms: u64,
    },
    /// Block until the radios have confirmed everything.
    Settle,
}

/// Scenario file: a list of `[[steps]]` tables.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenarioFile {
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl ScenarioFile {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        toml::from_str(input).map_err(|e| anyhow::anyhow!("Invalid scenario TOML: {}", e))
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading scenario {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }
}

const CAPS: [Capability; 5] = [
    Capability::Internet,
    Capability::Internet,
    Capability::Mms,
    Capability::Ims,
    Capability::Supl,
];

/// Seeded generator of request churn, policy flips and radio faults.
///
/// The same seed and endpoint count always produce the same steps.
#[derive(Debug)]
pub struct RandomScenario {
    rng: StdRng,
    endpoint_count: usize,
    next_id: u64,
    live: Vec<u64>,
}

impl RandomScenario {
    pub fn new(seed: u64, endpoint_count: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            endpoint_count: endpoint_count.max(1),
            next_id: 1,
            live: Vec::new(),
        }
    }

    pub fn steps(&mut self, count: usize) -> Vec<Step> {
        (0..count).map(|_| self.next_step()).collect()
    }

    fn pick(&mut self, n: usize) -> usize {
        (self.rng.random::<u32>() as usize) % n.max(1)
    }

    fn endpoint(&mut self) -> usize {
        self.pick(self.endpoint_count)
    }

    fn next_step(&mut self) -> Step {
        let roll = self.pick(100);
        match roll {
            0..=39 => {
                let id = self.next_id;
                self.next_id += 1;
                self.live.push(id);
                let cap = CAPS[self.pick(CAPS.len())];
                let specifier = if self.rng.random::<f64>() < 0.5 {
                    Some(format!("endpoint:{}", self.endpoint()))
                } else {
                    None
                };
                let priority = if self.rng.random::<bool>() {
                    Some(self.pick(20) as i32)
                } else {
                    None
                };
                Step::Request {
                    id,
                    capabilities: vec![cap],
                    specifier,
                    priority,
                }
            }
            40..=59 if !self.live.is_empty() => {
                let idx = self.pick(self.live.len());
                Step::Release {
                    id: self.live.swap_remove(idx),
                }
            }
            60..=67 => Step::Allow {
                allowed: self.rng.random::<f64>() < 0.6,
                timeout_ms: if self.rng.random::<bool>() {
                    0
                } else {
                    50 + self.pick(150) as u64
                },
            },
            68..=74 => Step::Default {
                endpoint: self.endpoint(),
            },
            75..=79 => Step::DropSession {
                endpoint: self.endpoint(),
            },
            80..=84 => Step::Wait {
                ms: 5 + self.pick(40) as u64,
            },
            _ => Step::Settle,
        }
    }
}
