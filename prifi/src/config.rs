// Copyright (c) 2024 The PriFi Authors

//! Session configuration.
//!
//! A [`PrifiConfig`] is what an operator writes in a TOML file. The relay turns
//! it into an [`Parameters`] message (`ALL_ALL_PARAMETERS`) for every other
//! participant, adding the participant's assigned identity.

use crate::error::{PrifiError, PrifiResult};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::Path, time::Duration};

/// Parameter keys carried by `ALL_ALL_PARAMETERS`.
pub mod keys {
    #![allow(missing_docs)]
    pub const N_CLIENTS: &str = "NClients";
    pub const N_TRUSTEES: &str = "NTrustees";
    pub const NEXT_FREE_CLIENT_ID: &str = "NextFreeClientID";
    pub const NEXT_FREE_TRUSTEE_ID: &str = "NextFreeTrusteeID";
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const USE_UDP: &str = "UseUDP";
    pub const DOWNSTREAM_CELL_SIZE: &str = "DownstreamCellSize";
    pub const WINDOW_SIZE: &str = "WindowSize";
    pub const USE_DUMMY_DATA_DOWN: &str = "UseDummyDataDown";
    pub const DCNET_TYPE: &str = "DCNetType";
    pub const EQUIVOCATION_PROTECTION: &str = "EquivocationProtectionEnabled";
    pub const DISRUPTION_PROTECTION: &str = "DisruptionProtectionEnabled";
    pub const DOWNSTREAM_ENCRYPTED: &str = "DownstreamTrafficEncrypted";
    pub const EXPERIMENT_ROUND_LIMIT: &str = "ExperimentRoundLimit";
    pub const START_NOW: &str = "StartNow";
    pub const USE_OPEN_CLOSED_SLOTS: &str = "UseOpenClosedSlots";
    pub const OPEN_CLOSED_MIN_DELAY: &str = "OpenClosedSlotsMinDelayBetweenRequests";
    pub const TIMEOUT_PHASE_1: &str = "RelayTimeoutPhase1";
    pub const TIMEOUT_PHASE_2: &str = "RelayTimeoutPhase2";
    pub const TRUSTEE_CACHE_LOW_BOUND: &str = "TrusteeCacheLowBound";
    pub const TRUSTEE_CACHE_HIGH_BOUND: &str = "TrusteeCacheHighBound";
    pub const TRUSTEE_BASE_SLEEP_TIME: &str = "TrusteeBaseSleepTime";
    pub const TRUSTEE_NEVER_SLOW_DOWN: &str = "TrusteeNeverSlowDown";
    pub const DO_LATENCY_TESTS: &str = "DoLatencyTests";
    pub const LATENCY_TESTS_INTERVAL: &str = "LatencyTestsInterval";
}

/// Typed key/value maps of an `ALL_ALL_PARAMETERS` message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameters {
    /// Integer parameters
    pub ints: BTreeMap<String, i64>,
    /// Boolean parameters
    pub bools: BTreeMap<String, bool>,
    /// String parameters
    pub strings: BTreeMap<String, String>,
    /// Overwrite the state of an already initialized role
    pub force_params: bool,
}

impl Parameters {
    /// Set an integer parameter.
    pub fn set_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.ints.insert(key.to_string(), value);
        self
    }

    /// Set a boolean parameter.
    pub fn set_bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.bools.insert(key.to_string(), value);
        self
    }

    /// Set a string parameter.
    pub fn set_string(&mut self, key: &str, value: &str) -> &mut Self {
        self.strings.insert(key.to_string(), value.to_string());
        self
    }

    /// `ints[key]`, or `default`.
    pub fn int_or(&self, key: &str, default: i64) -> i64 {
        self.ints.get(key).copied().unwrap_or(default)
    }

    /// `bools[key]`, or `default`.
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.bools.get(key).copied().unwrap_or(default)
    }

    /// `strings[key]`, or `default`.
    pub fn string_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.strings.get(key).map(String::as_str).unwrap_or(default)
    }

    /// A non-negative integer parameter that must fit in `usize`.
    pub fn usize_or(&self, key: &str, default: usize) -> PrifiResult<usize> {
        match self.ints.get(key) {
            None => Ok(default),
            Some(&value) => usize::try_from(value)
                .map_err(|_| PrifiError::InvalidParameters(format!("{key} = {value}"))),
        }
    }
}

/// Flavour of DC-net used for the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DcNetType {
    /// XOR of keystream pads
    #[default]
    Simple,
    /// Verifiable DC-net. Recognized in parameters but not supported.
    Verifiable,
}

impl DcNetType {
    /// Parameter value of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DcNetType::Simple => "Simple",
            DcNetType::Verifiable => "Verifiable",
        }
    }

    /// Parse a parameter value.
    pub fn parse(value: &str) -> PrifiResult<Self> {
        match value {
            "Simple" => Ok(DcNetType::Simple),
            "Verifiable" => Ok(DcNetType::Verifiable),
            other => Err(PrifiError::InvalidParameters(format!(
                "unknown DCNetType {other}"
            ))),
        }
    }
}

impl fmt::Display for DcNetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay-local tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Run open/closed reservation rounds
    pub use_open_closed_slots: bool,

    /// Delay before the next downstream cell when every slot is closed (ms)
    pub open_closed_slots_min_delay_ms: u64,

    /// First timeout after a downstream cell (ms)
    pub timeout_phase1_ms: u64,

    /// Second timeout, counted from the end of the first (ms)
    pub timeout_phase2_ms: u64,

    /// Resume a trustee when it has at most this many buffered ciphers
    pub trustee_cache_low_bound: usize,

    /// Slow a trustee down when it has at least this many buffered ciphers
    pub trustee_cache_high_bound: usize,

    /// Start the setup as soon as the parameters are received
    pub start_now: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            use_open_closed_slots: false,
            open_closed_slots_min_delay_ms: 1000,
            timeout_phase1_ms: 1000,
            timeout_phase2_ms: 1000,
            trustee_cache_low_bound: 1,
            trustee_cache_high_bound: 10,
            start_now: true,
        }
    }
}

impl RelayConfig {
    /// Phase 1 timeout as a duration.
    pub fn timeout_phase1(&self) -> Duration {
        Duration::from_millis(self.timeout_phase1_ms)
    }

    /// Phase 2 timeout as a duration.
    pub fn timeout_phase2(&self) -> Duration {
        Duration::from_millis(self.timeout_phase2_ms)
    }

    /// Open/closed back-off as a duration.
    pub fn open_closed_slots_min_delay(&self) -> Duration {
        Duration::from_millis(self.open_closed_slots_min_delay_ms)
    }
}

/// Trustee cipher loop tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrusteeConfig {
    /// Sleep between two ciphers when the relay asked to slow down (ms)
    pub base_sleep_time_ms: u64,

    /// Ignore slow-down requests
    pub never_slow_down: bool,
}

impl Default for TrusteeConfig {
    fn default() -> Self {
        Self {
            base_sleep_time_ms: 10,
            never_slow_down: false,
        }
    }
}

/// Client tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Send latency probes when owning a slot
    pub do_latency_tests: bool,

    /// Minimum interval between two probes (ms)
    pub latency_tests_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            do_latency_tests: false,
            latency_tests_interval_ms: 5000,
        }
    }
}

/// Configuration of a PriFi session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrifiConfig {
    /// Number of clients (n)
    pub n_clients: usize,

    /// Number of trustees (m)
    pub n_trustees: usize,

    /// Upstream payload length in bytes (P)
    pub payload_size: usize,

    /// Broadcast downstream cells as UDP datagrams
    pub use_udp: bool,

    /// Downstream cell size when padding with dummy data
    pub downstream_cell_size: usize,

    /// Maximum number of concurrently open rounds at the relay (W)
    pub window_size: usize,

    /// Pad every downstream cell to `downstream_cell_size`
    pub use_dummy_data_down: bool,

    /// DC-net flavour
    pub dcnet_type: DcNetType,

    /// Bind every cipher to the downstream history
    pub equivocation_protection: bool,

    /// Authenticate slot payloads and allow blame
    pub disruption_protection: bool,

    /// Encrypt unicast downstream cells per client
    pub downstream_traffic_encrypted: bool,

    /// Stop after this many rounds
    pub experiment_round_limit: Option<u32>,

    /// Relay tuning
    pub relay: RelayConfig,

    /// Trustee tuning
    pub trustee: TrusteeConfig,

    /// Client tuning
    pub client: ClientConfig,
}

impl Default for PrifiConfig {
    fn default() -> Self {
        Self {
            n_clients: 1,
            n_trustees: 1,
            payload_size: 1000,
            use_udp: false,
            downstream_cell_size: 10000,
            window_size: 1,
            use_dummy_data_down: false,
            dcnet_type: DcNetType::Simple,
            equivocation_protection: false,
            disruption_protection: false,
            downstream_traffic_encrypted: false,
            experiment_round_limit: None,
            relay: RelayConfig::default(),
            trustee: TrusteeConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl PrifiConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(contents: &str) -> PrifiResult<Self> {
        let config: PrifiConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> PrifiResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PrifiError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> PrifiResult<String> {
        toml::to_string_pretty(self).map_err(|e| PrifiError::Config(e.to_string()))
    }

    /// Reject configurations no role can run.
    pub fn validate(&self) -> PrifiResult<()> {
        if self.n_clients < 1 {
            return Err(PrifiError::InvalidParameters("need at least one client".into()));
        }
        if self.n_trustees < 1 {
            return Err(PrifiError::InvalidParameters("need at least one trustee".into()));
        }
        if self.payload_size < 1 {
            return Err(PrifiError::InvalidParameters("payload size cannot be 0".into()));
        }
        if self.window_size < 1 {
            return Err(PrifiError::InvalidParameters("window size cannot be 0".into()));
        }
        if self.dcnet_type != DcNetType::Simple {
            return Err(PrifiError::InvalidParameters(format!(
                "DCNetType {} is not supported",
                self.dcnet_type
            )));
        }
        if self.downstream_traffic_encrypted && self.use_udp {
            return Err(PrifiError::InvalidParameters(
                "downstream encryption needs unicast downstream, disable UseUDP".into(),
            ));
        }
        if self.disruption_protection && self.payload_size <= crate::dcnet::disruption::SLOT_TAG_LENGTH {
            return Err(PrifiError::InvalidParameters(format!(
                "disruption protection needs a payload larger than {} bytes",
                crate::dcnet::disruption::SLOT_TAG_LENGTH
            )));
        }
        if self.relay.use_open_closed_slots
            && self.payload_size < crate::scheduler::bitmask::mask_length(self.n_clients)
        {
            return Err(PrifiError::InvalidParameters(format!(
                "open/closed masks for {} clients do not fit a {}-byte payload",
                self.n_clients, self.payload_size
            )));
        }
        if self.relay.trustee_cache_low_bound > self.relay.trustee_cache_high_bound {
            return Err(PrifiError::InvalidParameters(
                "trustee cache low bound exceeds the high bound".into(),
            ));
        }
        Ok(())
    }

    /// Session parameters as sent in `ALL_ALL_PARAMETERS`.
    pub fn to_parameters(&self) -> Parameters {
        let mut params = Parameters::default();
        params
            .set_int(keys::N_CLIENTS, self.n_clients as i64)
            .set_int(keys::N_TRUSTEES, self.n_trustees as i64)
            .set_int(keys::PAYLOAD_SIZE, self.payload_size as i64)
            .set_bool(keys::USE_UDP, self.use_udp)
            .set_int(keys::DOWNSTREAM_CELL_SIZE, self.downstream_cell_size as i64)
            .set_int(keys::WINDOW_SIZE, self.window_size as i64)
            .set_bool(keys::USE_DUMMY_DATA_DOWN, self.use_dummy_data_down)
            .set_string(keys::DCNET_TYPE, self.dcnet_type.as_str())
            .set_bool(keys::EQUIVOCATION_PROTECTION, self.equivocation_protection)
            .set_bool(keys::DISRUPTION_PROTECTION, self.disruption_protection)
            .set_bool(keys::DOWNSTREAM_ENCRYPTED, self.downstream_traffic_encrypted)
            .set_int(
                keys::EXPERIMENT_ROUND_LIMIT,
                self.experiment_round_limit.map_or(-1, i64::from),
            )
            .set_bool(keys::START_NOW, self.relay.start_now)
            .set_bool(keys::USE_OPEN_CLOSED_SLOTS, self.relay.use_open_closed_slots)
            .set_int(
                keys::OPEN_CLOSED_MIN_DELAY,
                self.relay.open_closed_slots_min_delay_ms as i64,
            )
            .set_int(keys::TIMEOUT_PHASE_1, self.relay.timeout_phase1_ms as i64)
            .set_int(keys::TIMEOUT_PHASE_2, self.relay.timeout_phase2_ms as i64)
            .set_int(
                keys::TRUSTEE_CACHE_LOW_BOUND,
                self.relay.trustee_cache_low_bound as i64,
            )
            .set_int(
                keys::TRUSTEE_CACHE_HIGH_BOUND,
                self.relay.trustee_cache_high_bound as i64,
            )
            .set_int(
                keys::TRUSTEE_BASE_SLEEP_TIME,
                self.trustee.base_sleep_time_ms as i64,
            )
            .set_bool(keys::TRUSTEE_NEVER_SLOW_DOWN, self.trustee.never_slow_down)
            .set_bool(keys::DO_LATENCY_TESTS, self.client.do_latency_tests)
            .set_int(
                keys::LATENCY_TESTS_INTERVAL,
                self.client.latency_tests_interval_ms as i64,
            );
        params
    }

    /// Read a configuration from parameters; missing keys keep their default.
    pub fn from_parameters(params: &Parameters) -> PrifiResult<Self> {
        let defaults = Self::default();
        let round_limit = params.int_or(keys::EXPERIMENT_ROUND_LIMIT, -1);
        let config = Self {
            n_clients: params.usize_or(keys::N_CLIENTS, defaults.n_clients)?,
            n_trustees: params.usize_or(keys::N_TRUSTEES, defaults.n_trustees)?,
            payload_size: params.usize_or(keys::PAYLOAD_SIZE, defaults.payload_size)?,
            use_udp: params.bool_or(keys::USE_UDP, defaults.use_udp),
            downstream_cell_size: params
                .usize_or(keys::DOWNSTREAM_CELL_SIZE, defaults.downstream_cell_size)?,
            window_size: params.usize_or(keys::WINDOW_SIZE, defaults.window_size)?,
            use_dummy_data_down: params
                .bool_or(keys::USE_DUMMY_DATA_DOWN, defaults.use_dummy_data_down),
            dcnet_type: DcNetType::parse(params.string_or(keys::DCNET_TYPE, "Simple"))?,
            equivocation_protection: params
                .bool_or(keys::EQUIVOCATION_PROTECTION, defaults.equivocation_protection),
            disruption_protection: params
                .bool_or(keys::DISRUPTION_PROTECTION, defaults.disruption_protection),
            downstream_traffic_encrypted: params
                .bool_or(keys::DOWNSTREAM_ENCRYPTED, defaults.downstream_traffic_encrypted),
            experiment_round_limit: u32::try_from(round_limit).ok(),
            relay: RelayConfig {
                use_open_closed_slots: params.bool_or(
                    keys::USE_OPEN_CLOSED_SLOTS,
                    defaults.relay.use_open_closed_slots,
                ),
                open_closed_slots_min_delay_ms: params.usize_or(
                    keys::OPEN_CLOSED_MIN_DELAY,
                    defaults.relay.open_closed_slots_min_delay_ms as usize,
                )? as u64,
                timeout_phase1_ms: params
                    .usize_or(keys::TIMEOUT_PHASE_1, defaults.relay.timeout_phase1_ms as usize)?
                    as u64,
                timeout_phase2_ms: params
                    .usize_or(keys::TIMEOUT_PHASE_2, defaults.relay.timeout_phase2_ms as usize)?
                    as u64,
                trustee_cache_low_bound: params.usize_or(
                    keys::TRUSTEE_CACHE_LOW_BOUND,
                    defaults.relay.trustee_cache_low_bound,
                )?,
                trustee_cache_high_bound: params.usize_or(
                    keys::TRUSTEE_CACHE_HIGH_BOUND,
                    defaults.relay.trustee_cache_high_bound,
                )?,
                start_now: params.bool_or(keys::START_NOW, defaults.relay.start_now),
            },
            trustee: TrusteeConfig {
                base_sleep_time_ms: params.usize_or(
                    keys::TRUSTEE_BASE_SLEEP_TIME,
                    defaults.trustee.base_sleep_time_ms as usize,
                )? as u64,
                never_slow_down: params
                    .bool_or(keys::TRUSTEE_NEVER_SLOW_DOWN, defaults.trustee.never_slow_down),
            },
            client: ClientConfig {
                do_latency_tests: params
                    .bool_or(keys::DO_LATENCY_TESTS, defaults.client.do_latency_tests),
                latency_tests_interval_ms: params.usize_or(
                    keys::LATENCY_TESTS_INTERVAL,
                    defaults.client.latency_tests_interval_ms as usize,
                )? as u64,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Bytes of application data an owner can place in one upstream cell.
    pub fn usable_payload_size(&self) -> usize {
        if self.disruption_protection {
            self.payload_size - crate::dcnet::disruption::SLOT_TAG_LENGTH
        } else {
            self.payload_size
        }
    }
}
