use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use activity_analyzer::AnalyzerConfig;
use anyhow::{bail, Context, Result};
use calibration::WarmupConfig;
use chrono::DateTime;
use core_types::BinaryMarket;
use market_state::TrackerConfig;
use risk_engine::{Archetype, ArchetypeTable, MarchetypeProfile, RiskConfig};
use serde::Deserialize;
use strategy_maker::{GapAction, QuoteConfig, SupervisorConfig};
use vol_indicators::ToxicityConfig;

pub(crate) const DEFAULT_CONFIG_PATH: &str = "configs/polyquote.toml";

#[derive(Debug, Clone)]
pub(crate) struct PersistenceConfig {
    pub(crate) state_dir: PathBuf,
    pub(crate) checkpoint_interval_s: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("var/state"),
            checkpoint_interval_s: 300.0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) market: BinaryMarket,
    pub(crate) tracker: TrackerConfig,
    pub(crate) warmup: WarmupConfig,
    pub(crate) toxicity: ToxicityConfig,
    pub(crate) analyzer: AnalyzerConfig,
    pub(crate) risk: RiskConfig,
    pub(crate) archetypes: ArchetypeTable,
    pub(crate) quote: QuoteConfig,
    pub(crate) supervisor: SupervisorConfig,
    pub(crate) refresh_interval_ms: u64,
    pub(crate) persistence: PersistenceConfig,
    pub(crate) control_listen: Option<SocketAddr>,
    pub(crate) log_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    market: Option<MarketFile>,
    warmup: WarmupFile,
    toxicity: ToxicityFile,
    risk: RiskFile,
    quote: QuoteFile,
    archetypes: BTreeMap<String, ArchetypeFile>,
    persistence: PersistenceFile,
    control_api: ControlApiFile,
    logging: LoggingFile,
}

#[derive(Debug, Deserialize)]
struct MarketFile {
    market_id: String,
    yes_asset_id: String,
    no_asset_id: String,
    start_ts_ms: Option<i64>,
    resolve_ts_ms: Option<i64>,
    /// RFC 3339, used when `resolve_ts_ms` is absent.
    resolve_at: Option<String>,
    tick_size: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WarmupFile {
    observation_cadence_ms: Option<u64>,
    min_price_changes: Option<usize>,
    min_trades: Option<usize>,
    observation_timeout_s: Option<f64>,
    dt_min_s: Option<f64>,
    dt_max_s: Option<f64>,
    tau_fast_min_s: Option<f64>,
    tau_fast_max_s: Option<f64>,
    slow_fast_ratio: Option<f64>,
    tau_slow_max_s: Option<f64>,
    markout_max_s: Option<f64>,
    min_return_samples: Option<usize>,
    max_sampling_s: Option<f64>,
    adaptation_half_life_s: Option<f64>,
    adaptation_interval_s: Option<f64>,
    adaptation_window_s: Option<f64>,
    default_baseline_volatility: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToxicityFile {
    c_sigma: Option<f64>,
    nu: Option<f64>,
    sigma_max: Option<f64>,
    c_tox: Option<f64>,
    i_max: Option<f64>,
    rate_ref_per_s: Option<f64>,
    tau_sigma_up_s: Option<f64>,
    tau_sigma_down_s: Option<f64>,
    markout_w1: Option<f64>,
    markout_w2: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RiskFile {
    bankroll: Option<f64>,
    n_plays: Option<u32>,
    capital_weight: Option<f64>,
    eta_time: Option<f64>,
    slippage_buffer: Option<f64>,
    gamma_a: Option<f64>,
    gamma_max: Option<f64>,
    q_hat_cap: Option<f64>,
    w_a: Option<f64>,
    w_l: Option<f64>,
    archetype: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QuoteFile {
    refresh_interval_ms: Option<u64>,
    c_risk: Option<f64>,
    kappa0: Option<f64>,
    rate_ref_per_s: Option<f64>,
    min_half_spread_prob: Option<f64>,
    max_half_spread_logit: Option<f64>,
    ladder_decay: Option<f64>,
    ladder_step_mult: Option<f64>,
    ladder_min_step_logit: Option<f64>,
    ladder_max_levels: Option<usize>,
    ladder_risk_fraction: Option<f64>,
    min_order_size: Option<f64>,
    max_order_size: Option<f64>,
    max_order_notional_side: Option<f64>,
    feed_gap_timeout_s: Option<f64>,
    gap_action: Option<GapAction>,
    defensive_spread_mult: Option<f64>,
    halt_after_degenerate: Option<u32>,
    stale_after_skips: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ArchetypeFile {
    beta_p: Option<f64>,
    alpha_u: Option<f64>,
    u_ref: Option<f64>,
    lambda_min: Option<f64>,
    lambda_max: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PersistenceFile {
    state_dir: Option<PathBuf>,
    checkpoint_interval_s: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ControlApiFile {
    listen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingFile {
    dir: Option<PathBuf>,
}

pub(crate) fn resolve_config_path(cli: Option<PathBuf>) -> PathBuf {
    cli.filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub(crate) fn load_app_config(path: &Path, now_ms: i64) -> Result<AppConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse_app_config(&raw, now_ms).with_context(|| format!("parse config {}", path.display()))
}

/// `now_ms` stands in for an unset market start.
pub(crate) fn parse_app_config(raw: &str, now_ms: i64) -> Result<AppConfig> {
    let file: FileConfig = toml::from_str(raw).context("invalid toml")?;
    let Some(market_file) = file.market else {
        bail!("missing [market] section");
    };

    let mut tracker = TrackerConfig::default();
    if let Some(tick) = market_file.tick_size {
        tracker.default_tick_size = tick.clamp(0.0001, 0.1);
    }
    let market = build_market(market_file, now_ms)?;

    let warmup = apply_warmup(file.warmup);
    let toxicity = apply_toxicity(file.toxicity);
    let risk = apply_risk(file.risk)?;
    let archetypes = apply_archetypes(file.archetypes)?;
    let (quote, supervisor, refresh_interval_ms) = apply_quote(file.quote);

    let mut persistence = PersistenceConfig::default();
    if let Some(dir) = file.persistence.state_dir {
        persistence.state_dir = dir;
    }
    if let Some(v) = file.persistence.checkpoint_interval_s {
        persistence.checkpoint_interval_s = v.max(5.0);
    }

    let control_listen = match file.control_api.listen.filter(|v| !v.trim().is_empty()) {
        Some(addr) => Some(
            addr.trim()
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid control_api.listen {addr:?}"))?,
        ),
        None => None,
    };

    Ok(AppConfig {
        market,
        tracker,
        warmup,
        toxicity,
        analyzer: AnalyzerConfig::default(),
        risk,
        archetypes,
        quote,
        supervisor,
        refresh_interval_ms,
        persistence,
        control_listen,
        log_dir: file.logging.dir,
    })
}

fn build_market(file: MarketFile, now_ms: i64) -> Result<BinaryMarket> {
    for (name, value) in [
        ("market_id", &file.market_id),
        ("yes_asset_id", &file.yes_asset_id),
        ("no_asset_id", &file.no_asset_id),
    ] {
        if value.trim().is_empty() {
            bail!("market.{name} must not be empty");
        }
    }
    if file.yes_asset_id == file.no_asset_id {
        bail!("market.yes_asset_id and market.no_asset_id must differ");
    }
    let resolve_ts_ms = match (file.resolve_ts_ms, file.resolve_at.as_deref()) {
        (Some(ts), _) => ts,
        (None, Some(at)) => DateTime::parse_from_rfc3339(at.trim())
            .with_context(|| format!("invalid market.resolve_at {at:?}"))?
            .timestamp_millis(),
        (None, None) => bail!("market.resolve_ts_ms or market.resolve_at is required"),
    };
    let start_ts_ms = file.start_ts_ms.unwrap_or(now_ms);
    if resolve_ts_ms <= start_ts_ms {
        bail!("market resolves at {resolve_ts_ms}, not after start {start_ts_ms}");
    }
    Ok(BinaryMarket {
        market_id: file.market_id.trim().to_string(),
        yes_asset_id: file.yes_asset_id.trim().to_string(),
        no_asset_id: file.no_asset_id.trim().to_string(),
        start_ts_ms,
        resolve_ts_ms,
    })
}

fn apply_warmup(file: WarmupFile) -> WarmupConfig {
    let mut cfg = WarmupConfig::default();
    if let Some(v) = file.observation_cadence_ms {
        cfg.observation_cadence_ms = v.max(10);
    }
    if let Some(v) = file.min_price_changes {
        cfg.min_price_changes = v.max(2);
    }
    if let Some(v) = file.min_trades {
        cfg.min_trades = v;
    }
    if let Some(v) = file.observation_timeout_s {
        cfg.observation_timeout_s = v.max(1.0);
    }
    if let Some(v) = file.dt_min_s {
        cfg.dt_min_s = v.max(0.1);
    }
    if let Some(v) = file.dt_max_s {
        cfg.dt_max_s = v.max(cfg.dt_min_s);
    }
    if let Some(v) = file.tau_fast_min_s {
        cfg.tau_fast_min_s = v.max(cfg.dt_min_s);
    }
    if let Some(v) = file.tau_fast_max_s {
        cfg.tau_fast_max_s = v.max(cfg.tau_fast_min_s);
    }
    if let Some(v) = file.slow_fast_ratio {
        cfg.slow_fast_ratio = v.max(2.0);
    }
    if let Some(v) = file.tau_slow_max_s {
        cfg.tau_slow_max_s = v.max(cfg.tau_fast_max_s * 2.0);
    }
    if let Some(v) = file.markout_max_s {
        cfg.markout_max_s = v.max(2.0);
    }
    if let Some(v) = file.min_return_samples {
        cfg.min_return_samples = v.max(2);
    }
    if let Some(v) = file.max_sampling_s {
        cfg.max_sampling_s = v.max(1.0);
    }
    if let Some(v) = file.adaptation_half_life_s {
        cfg.adaptation_half_life_s = v.max(1.0);
    }
    if let Some(v) = file.adaptation_interval_s {
        cfg.adaptation_interval_s = v.max(1.0);
    }
    if let Some(v) = file.adaptation_window_s {
        cfg.adaptation_window_s = v.max(cfg.adaptation_interval_s);
    }
    if let Some(v) = file.default_baseline_volatility {
        cfg.defaults.baseline_volatility = v.max(0.0);
    }
    cfg
}

fn apply_toxicity(file: ToxicityFile) -> ToxicityConfig {
    let mut cfg = ToxicityConfig::default();
    if let Some(v) = file.c_sigma {
        cfg.c_sigma = v.max(0.0);
    }
    if let Some(v) = file.nu {
        cfg.nu = v.max(1.0);
    }
    if let Some(v) = file.sigma_max {
        cfg.sigma_max = v.max(1.0);
    }
    if let Some(v) = file.c_tox {
        cfg.c_tox = v.max(0.0);
    }
    if let Some(v) = file.i_max {
        cfg.i_max = v.max(1.0);
    }
    if let Some(v) = file.rate_ref_per_s {
        cfg.rate_ref_per_s = v.max(1e-6);
    }
    if let Some(v) = file.tau_sigma_up_s {
        cfg.tau_sigma_up_s = v.max(0.1);
    }
    if let Some(v) = file.tau_sigma_down_s {
        cfg.tau_sigma_down_s = v.max(0.1);
    }
    if let Some(v) = file.markout_w1 {
        cfg.markout_w1 = v.max(0.0);
    }
    if let Some(v) = file.markout_w2 {
        cfg.markout_w2 = v.max(0.0);
    }
    cfg
}

fn apply_risk(file: RiskFile) -> Result<RiskConfig> {
    let mut cfg = RiskConfig::default();
    if let Some(v) = file.bankroll {
        cfg.bankroll = v.max(0.0);
    }
    if let Some(v) = file.n_plays {
        cfg.n_plays = v.max(1);
    }
    if let Some(v) = file.capital_weight {
        cfg.capital_weight = Some(v.clamp(0.0, 1.0));
    }
    if let Some(v) = file.eta_time {
        cfg.eta_time = v.max(0.0);
    }
    if let Some(v) = file.slippage_buffer {
        cfg.slippage_buffer = v.clamp(0.0, 0.9);
    }
    if let Some(v) = file.gamma_a {
        cfg.gamma_a = v.max(0.0);
    }
    if let Some(v) = file.gamma_max {
        cfg.gamma_max = v.max(1.0);
    }
    if let Some(v) = file.q_hat_cap {
        cfg.q_hat_cap = v.clamp(0.5, 0.9999);
    }
    if let Some(v) = file.w_a {
        cfg.w_a = v.max(0.0);
    }
    if let Some(v) = file.w_l {
        cfg.w_l = v.max(0.0);
    }
    if let Some(name) = file.archetype {
        cfg.archetype = name.parse::<Archetype>().context("risk.archetype")?;
    }
    Ok(cfg)
}

fn apply_archetypes(files: BTreeMap<String, ArchetypeFile>) -> Result<ArchetypeTable> {
    let mut overrides = Vec::with_capacity(files.len());
    for (key, file) in files {
        let archetype = key
            .parse::<Archetype>()
            .with_context(|| format!("[archetypes.{key}]"))?;
        let base = archetype.default_profile();
        overrides.push((
            archetype,
            MarchetypeProfile {
                beta_p: file.beta_p.unwrap_or(base.beta_p),
                alpha_u: file.alpha_u.unwrap_or(base.alpha_u),
                u_ref: file.u_ref.unwrap_or(base.u_ref),
                lambda_min: file.lambda_min.unwrap_or(base.lambda_min),
                lambda_max: file.lambda_max.unwrap_or(base.lambda_max),
            },
        ));
    }
    Ok(ArchetypeTable::with_overrides(overrides)?)
}

fn apply_quote(file: QuoteFile) -> (QuoteConfig, SupervisorConfig, u64) {
    let mut cfg = QuoteConfig::default();
    let mut sup = SupervisorConfig::default();
    let refresh_interval_ms = file.refresh_interval_ms.unwrap_or(2_000).max(100);

    if let Some(v) = file.c_risk {
        cfg.c_risk = v.max(0.0);
    }
    if let Some(v) = file.kappa0 {
        cfg.kappa0 = v.max(1e-6);
    }
    if let Some(v) = file.rate_ref_per_s {
        cfg.rate_ref_per_s = v.max(1e-6);
    }
    if let Some(v) = file.min_half_spread_prob {
        cfg.min_half_spread_prob = v.clamp(0.0, 0.2);
    }
    if let Some(v) = file.max_half_spread_logit {
        cfg.max_half_spread_logit = v.max(0.01);
    }
    if let Some(v) = file.ladder_decay {
        cfg.ladder.decay = v.clamp(0.0, 1.0);
    }
    if let Some(v) = file.ladder_step_mult {
        cfg.ladder.step_mult = v.max(0.0);
    }
    if let Some(v) = file.ladder_min_step_logit {
        cfg.ladder.min_step_logit = v.max(0.001);
    }
    if let Some(v) = file.ladder_max_levels {
        cfg.ladder.max_levels = v.clamp(1, 20);
    }
    if let Some(v) = file.ladder_risk_fraction {
        cfg.ladder.risk_fraction = v.clamp(0.0, 1.0);
    }
    if let Some(v) = file.min_order_size {
        cfg.min_order_size = v.max(0.0);
    }
    if let Some(v) = file.max_order_size {
        cfg.max_order_size = v.max(cfg.min_order_size);
    }
    if let Some(v) = file.max_order_notional_side {
        cfg.max_order_notional_side = v.max(0.0);
    }

    if let Some(v) = file.feed_gap_timeout_s {
        sup.feed_gap_timeout_ms = (v.max(0.5) * 1_000.0) as i64;
    }
    if let Some(v) = file.gap_action {
        sup.gap_action = v;
    }
    if let Some(v) = file.defensive_spread_mult {
        sup.defensive_spread_mult = v.max(1.0);
    }
    if let Some(v) = file.halt_after_degenerate {
        sup.halt_after_degenerate = v.max(1);
    }
    if let Some(v) = file.stale_after_skips {
        sup.stale_after_skips = v.max(1);
    }
    (cfg, sup, refresh_interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[market]
market_id = "0xabc"
yes_asset_id = "111"
no_asset_id = "222"
resolve_at = "2026-11-05T00:00:00Z"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse_app_config(MINIMAL, 1_700_000_000_000).unwrap();
        assert_eq!(cfg.market.market_id, "0xabc");
        assert_eq!(cfg.market.start_ts_ms, 1_700_000_000_000);
        assert!(cfg.market.resolve_ts_ms > cfg.market.start_ts_ms);
        assert_eq!(cfg.refresh_interval_ms, 2_000);
        assert_eq!(cfg.risk, RiskConfig::default());
        assert_eq!(cfg.quote, QuoteConfig::default());
        assert!(cfg.control_listen.is_none());
        assert_eq!(cfg.archetypes, ArchetypeTable::default());
    }

    #[test]
    fn sections_override_and_clamp() {
        let raw = format!(
            "{MINIMAL}
[risk]
bankroll = 200.0
slippage_buffer = 3.0
archetype = \"A1\"

[quote]
refresh_interval_ms = 10
ladder_max_levels = 99
gap_action = \"withdraw\"
feed_gap_timeout_s = 4.0

[archetypes.a1]
lambda_max = 3.0

[control_api]
listen = \"127.0.0.1:9100\"
"
        );
        let cfg = parse_app_config(&raw, 0).unwrap();
        assert_eq!(cfg.risk.bankroll, 200.0);
        assert_eq!(cfg.risk.slippage_buffer, 0.9);
        assert_eq!(cfg.risk.archetype, Archetype::A1);
        assert_eq!(cfg.refresh_interval_ms, 100);
        assert_eq!(cfg.quote.ladder.max_levels, 20);
        assert_eq!(cfg.supervisor.gap_action, GapAction::Withdraw);
        assert_eq!(cfg.supervisor.feed_gap_timeout_ms, 4_000);
        assert_eq!(cfg.archetypes.get(Archetype::A1).lambda_max, 3.0);
        assert_eq!(cfg.archetypes.get(Archetype::A1).lambda_min, 1.0);
        assert_eq!(cfg.control_listen, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn shipped_sample_config_parses() {
        let raw = include_str!("../../../configs/polyquote.toml");
        let cfg = parse_app_config(raw, 0).unwrap();
        assert_eq!(cfg.risk, RiskConfig::default());
        assert_eq!(cfg.quote, QuoteConfig::default());
        assert_eq!(cfg.archetypes, ArchetypeTable::default());
        assert_eq!(cfg.persistence.checkpoint_interval_s, 300.0);
        assert_eq!(cfg.control_listen, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn missing_market_section_is_an_error() {
        let err = parse_app_config("[risk]\nbankroll = 10.0\n", 0).unwrap_err();
        assert!(err.to_string().contains("[market]"));
    }

    #[test]
    fn invalid_archetype_overrides_fail_at_load() {
        let raw = format!("{MINIMAL}\n[archetypes.a2]\nlambda_min = 3.0\nlambda_max = 1.0\n");
        assert!(parse_app_config(&raw, 0).is_err());
        let raw = format!("{MINIMAL}\n[archetypes.a9]\nbeta_p = 1.0\n");
        assert!(parse_app_config(&raw, 0).is_err());
    }

    #[test]
    fn resolution_must_follow_start() {
        let raw = r#"
[market]
market_id = "m"
yes_asset_id = "y"
no_asset_id = "n"
start_ts_ms = 5000
resolve_ts_ms = 4000
"#;
        assert!(parse_app_config(raw, 0).is_err());
    }
}
