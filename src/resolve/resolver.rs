// =============================================================================
// Symbol Resolver: multi-strategy resolution with exchange fallback
// =============================================================================
//
// Input shape decides the strategy:
//
//   "CACHE_STATS" / "CLEAR_CACHE"   synthetic, intercepted before any lookup
//   all digits                      contract id (9 digits reads as a CUSIP)
//   12-char country-prefixed code   ISIN
//   short uppercase token           exact symbol, with alias cascade
//   anything else                   fuzzy search
//
// The exact strategy cascades: requested exchange, then its alias chain in
// order, then SMART routing. Fuzzy consults the reverse company-name index
// first, then a rate-gated remote search, falling back to exact on remote
// failure when configured.
//
// Matches are confidence-scored, sorted descending, and truncated to the
// query's max_results (hard cap 16). Failures never enter the cache.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::ibkr::contracts::{Contract, ContractDescription};
use crate::ibkr::session::BrokerSession;
use crate::resolve::aliases::alias_chain;
use crate::resolve::cache::{CacheKey, CacheStats, ResolutionCache};
use crate::safety::RateLimiter;
use crate::types::{OpClass, SecType};

/// Hard ceiling on returned matches regardless of the query.
const MAX_RESULTS_CAP: u32 = 16;

// ---------------------------------------------------------------------------
// Query and result model
// ---------------------------------------------------------------------------

fn default_max_results() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// A resolution request as received from the tool surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionQuery {
    #[serde(alias = "input")]
    pub raw_input: String,
    #[serde(default)]
    pub exchange_hint: Option<String>,
    #[serde(default)]
    pub currency_hint: Option<String>,
    #[serde(default)]
    pub sec_type: SecType,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_true")]
    pub fuzzy_enabled: bool,
    #[serde(default)]
    pub include_alt_ids: bool,
    #[serde(default)]
    pub prefer_native_exchange: bool,
}

impl ResolutionQuery {
    pub fn for_input(raw_input: &str) -> Self {
        Self {
            raw_input: raw_input.to_string(),
            exchange_hint: None,
            currency_hint: None,
            sec_type: SecType::Stock,
            max_results: default_max_results(),
            fuzzy_enabled: true,
            include_alt_ids: false,
            prefer_native_exchange: false,
        }
    }
}

/// How a match was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMethod {
    ExactSymbol,
    ExchangeAlias,
    AlternativeId,
    Fuzzy,
    SmartFallback,
}

/// One resolved contract with its confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMatch {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub contract_id: i64,
    pub exchange: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_exchange: Option<String>,
    pub currency: String,
    pub security_type: SecType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cusip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isin: Option<String>,
    pub confidence: f64,
    pub resolution_method: ResolutionMethod,
}

/// Full resolution response, including the fallback trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub matches: Vec<SymbolMatch>,
    pub cache_hit: bool,
    pub resolved_via_alias: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_exchange: Option<String>,
    pub exchanges_tried: Vec<String>,
}

impl ResolutionOutcome {
    fn empty(exchanges_tried: Vec<String>) -> Self {
        Self {
            matches: Vec::new(),
            cache_hit: false,
            resolved_via_alias: false,
            original_exchange: None,
            actual_exchange: None,
            exchanges_tried,
        }
    }

    fn with_matches(matches: Vec<SymbolMatch>, exchanges_tried: Vec<String>) -> Self {
        Self {
            matches,
            cache_hit: false,
            resolved_via_alias: false,
            original_exchange: None,
            actual_exchange: None,
            exchanges_tried,
        }
    }
}

/// Reply from the resolver: a real resolution or one of the synthetic
/// queries.
#[derive(Debug, Clone)]
pub enum ResolverReply {
    Outcome(ResolutionOutcome),
    Stats(CacheStats),
    Cleared,
}

// ---------------------------------------------------------------------------
// Input classification
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum InputShape {
    Exact(String),
    AltId { id_type: &'static str, id: String },
    Fuzzy(String),
}

fn classify(raw: &str) -> InputShape {
    let all_digits = !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit());
    if all_digits {
        // Nine digits reads as a CUSIP; anything else numeric is a broker
        // contract id.
        if raw.len() == 9 {
            return InputShape::AltId {
                id_type: "CUSIP",
                id: raw.to_string(),
            };
        }
        return InputShape::AltId {
            id_type: "CONID",
            id: raw.to_string(),
        };
    }

    let upper_alnum = raw
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if raw.len() == 9 && upper_alnum && raw.chars().any(|c| c.is_ascii_digit()) {
        return InputShape::AltId {
            id_type: "CUSIP",
            id: raw.to_string(),
        };
    }
    if raw.len() == 12
        && raw.chars().take(2).all(|c| c.is_ascii_uppercase())
        && raw.chars().skip(2).all(|c| c.is_ascii_alphanumeric())
        && raw.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false)
    {
        return InputShape::AltId {
            id_type: "ISIN",
            id: raw.to_string(),
        };
    }

    let exact_shape = !raw.is_empty()
        && raw.len() <= 10
        && raw.chars().any(|c| c.is_ascii_uppercase())
        && raw
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '-'));
    if exact_shape {
        return InputShape::Exact(raw.to_string());
    }

    InputShape::Fuzzy(raw.to_string())
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct SymbolResolver {
    session: Arc<BrokerSession>,
    cache: Arc<ResolutionCache>,
    rate_limiter: Arc<RateLimiter>,
    fallback_to_exact: bool,
}

impl SymbolResolver {
    pub fn new(
        session: Arc<BrokerSession>,
        cache: Arc<ResolutionCache>,
        rate_limiter: Arc<RateLimiter>,
        fallback_to_exact: bool,
    ) -> Self {
        Self {
            session,
            cache,
            rate_limiter,
            fallback_to_exact,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Resolve one query end to end.
    pub async fn resolve(&self, query: ResolutionQuery) -> Result<ResolverReply, GatewayError> {
        let raw = query.raw_input.trim().to_string();

        // Synthetic inputs bypass everything.
        if raw == "CACHE_STATS" {
            return Ok(ResolverReply::Stats(self.cache.stats()));
        }
        if raw == "CLEAR_CACHE" {
            self.cache.invalidate_all();
            return Ok(ResolverReply::Cleared);
        }

        let key = CacheKey::from_query(&query);
        let started = Instant::now();

        if let Some(mut outcome) = self.cache.get(&key) {
            outcome.cache_hit = true;
            self.cache.record_hit(elapsed_ms(started));
            return Ok(ResolverReply::Outcome(outcome));
        }

        let shape = classify(&raw);

        // A company-name query may hit the reverse index without any remote
        // call or rate-window spend.
        if matches!(shape, InputShape::Fuzzy(_)) {
            if let Some(mut outcome) = self.cache.reverse_lookup(&raw) {
                outcome.cache_hit = true;
                self.cache.record_hit(elapsed_ms(started));
                return Ok(ResolverReply::Outcome(outcome));
            }
        }

        // Single-flight: one remote lookup per fingerprint; queued callers
        // re-check the cache once the leader finishes.
        let flight = self.cache.flight_lock(&key);
        let _guard = flight.lock().await;
        if let Some(mut outcome) = self.cache.get(&key) {
            outcome.cache_hit = true;
            self.cache.record_hit(elapsed_ms(started));
            return Ok(ResolverReply::Outcome(outcome));
        }

        let result = match shape {
            InputShape::Exact(symbol) => self.exact_strategy(&query, &symbol).await,
            InputShape::AltId { id_type, id } => self.alt_id_strategy(&query, id_type, &id).await,
            InputShape::Fuzzy(input) => self.fuzzy_strategy(&query, &input).await,
        };

        let reply = match result {
            Ok(mut outcome) => {
                self.finalize(&query, &raw, &mut outcome);
                if !outcome.matches.is_empty() {
                    self.cache.insert(key.clone(), outcome.clone());
                }
                self.cache.record_miss(elapsed_ms(started));
                Ok(ResolverReply::Outcome(outcome))
            }
            Err(err) => {
                // Errors never enter the cache.
                self.cache.record_miss(elapsed_ms(started));
                Err(err)
            }
        };
        self.cache.release_flight(&key);
        reply
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    /// Qualification with cascading exchange fallback.
    async fn exact_strategy(
        &self,
        query: &ResolutionQuery,
        symbol: &str,
    ) -> Result<ResolutionOutcome, GatewayError> {
        let currency = query
            .currency_hint
            .clone()
            .unwrap_or_else(|| "USD".to_string());
        let requested = query.exchange_hint.as_ref().map(|e| e.to_uppercase());
        let first_exchange = requested.clone().unwrap_or_else(|| "SMART".to_string());

        let mut tried = vec![first_exchange.clone()];
        let matches = self
            .qualify(query, symbol, &first_exchange, &currency, ResolutionMethod::ExactSymbol)
            .await?;
        if !matches.is_empty() {
            return Ok(ResolutionOutcome::with_matches(matches, tried));
        }

        if let Some(hint) = &requested {
            for alias in alias_chain(hint) {
                tried.push(alias.to_string());
                let matches = self
                    .qualify(query, symbol, alias, &currency, ResolutionMethod::ExchangeAlias)
                    .await?;
                if !matches.is_empty() {
                    debug!(symbol, original = %hint, alias, "resolved via exchange alias");
                    return Ok(ResolutionOutcome {
                        matches,
                        cache_hit: false,
                        resolved_via_alias: true,
                        original_exchange: Some(hint.clone()),
                        actual_exchange: Some(alias.to_string()),
                        exchanges_tried: tried,
                    });
                }
            }

            if first_exchange != "SMART" {
                tried.push("SMART".to_string());
                let matches = self
                    .qualify(query, symbol, "SMART", &currency, ResolutionMethod::SmartFallback)
                    .await?;
                if !matches.is_empty() {
                    return Ok(ResolutionOutcome::with_matches(matches, tried));
                }
            }
        }

        Ok(ResolutionOutcome::empty(tried))
    }

    /// Single lookup by CUSIP / ISIN / contract id.
    async fn alt_id_strategy(
        &self,
        query: &ResolutionQuery,
        id_type: &'static str,
        id: &str,
    ) -> Result<ResolutionOutcome, GatewayError> {
        self.cache.record_api_call("alt_id_lookup");
        let contract = Contract::by_alt_id(id_type, id);
        let descs = match self.session.qualify_contracts(vec![contract]).await {
            Ok(descs) => descs,
            Err(GatewayError::BrokerRejected { reason }) => {
                debug!(id, id_type, reason = %reason, "alternative id lookup rejected");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let matches: Vec<SymbolMatch> = descs
            .into_iter()
            .map(|d| self.desc_to_match(d, ResolutionMethod::AlternativeId, query))
            .collect();
        Ok(ResolutionOutcome::with_matches(
            matches,
            vec!["SMART".to_string()],
        ))
    }

    /// Remote fuzzy search, gated at the upstream's imposed interval.
    async fn fuzzy_strategy(
        &self,
        query: &ResolutionQuery,
        input: &str,
    ) -> Result<ResolutionOutcome, GatewayError> {
        if !query.fuzzy_enabled {
            return Ok(ResolutionOutcome::empty(Vec::new()));
        }

        if self.rate_limiter.check(OpClass::FuzzySearch).is_err() {
            // Breaches return empty rather than queueing.
            warn!(input, "fuzzy search rate-limited; returning no matches");
            return Ok(ResolutionOutcome::empty(Vec::new()));
        }

        self.cache.record_api_call("matching_symbols");
        match self.session.req_matching_symbols(input).await {
            Ok(descs) => {
                let input_lower = input.to_lowercase();
                let matches: Vec<SymbolMatch> = descs
                    .into_iter()
                    .map(|d| {
                        let mut m = self.desc_to_match(d, ResolutionMethod::Fuzzy, query);
                        m.confidence = fuzzy_base_confidence(&input_lower, &m);
                        m
                    })
                    .collect();
                Ok(ResolutionOutcome::with_matches(matches, Vec::new()))
            }
            Err(GatewayError::NotConnected) => Err(GatewayError::NotConnected),
            Err(err) if self.fallback_to_exact => {
                warn!(input, error = %err, "fuzzy search failed; retrying as exact symbol");
                self.exact_strategy(query, &input.to_uppercase()).await
            }
            Err(err) => Err(err),
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn qualify(
        &self,
        query: &ResolutionQuery,
        symbol: &str,
        exchange: &str,
        currency: &str,
        method: ResolutionMethod,
    ) -> Result<Vec<SymbolMatch>, GatewayError> {
        self.cache.record_api_call("qualify_contracts");
        let mut contract = Contract::stock(symbol, exchange, currency);
        contract.sec_type = query.sec_type;

        match self.session.qualify_contracts(vec![contract]).await {
            Ok(descs) => Ok(descs
                .into_iter()
                .map(|d| self.desc_to_match(d, method, query))
                .collect()),
            Err(GatewayError::BrokerRejected { reason }) => {
                // "No security definition" style rejections just mean this
                // exchange does not list the symbol; the cascade continues.
                debug!(symbol, exchange, reason = %reason, "qualification empty");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn desc_to_match(
        &self,
        desc: ContractDescription,
        method: ResolutionMethod,
        query: &ResolutionQuery,
    ) -> SymbolMatch {
        SymbolMatch {
            symbol: desc.contract.symbol.clone(),
            name: desc.company_name,
            contract_id: desc.contract.con_id,
            exchange: desc.contract.exchange.clone(),
            primary_exchange: desc.contract.primary_exchange.clone(),
            currency: desc.contract.currency.clone(),
            security_type: desc.contract.sec_type,
            country: desc.country,
            cusip: if query.include_alt_ids { desc.cusip } else { None },
            isin: if query.include_alt_ids { desc.isin } else { None },
            confidence: 0.0,
            resolution_method: method,
        }
    }

    /// Score, order, truncate.
    fn finalize(&self, query: &ResolutionQuery, raw: &str, outcome: &mut ResolutionOutcome) {
        let raw_upper = raw.to_uppercase();
        let raw_lower = raw.to_lowercase();
        for m in &mut outcome.matches {
            m.confidence = score_match(m, query, &raw_upper, &raw_lower);
        }

        if query.prefer_native_exchange {
            outcome.matches.sort_by(|a, b| {
                let a_native = a.primary_exchange.as_deref() == Some(a.exchange.as_str());
                let b_native = b.primary_exchange.as_deref() == Some(b.exchange.as_str());
                b_native
                    .cmp(&a_native)
                    .then(
                        b.confidence
                            .partial_cmp(&a.confidence)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            });
        } else {
            outcome.matches.sort_by(|a, b| {
                b.confidence
                    .partial_cmp(&a.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let cap = query.max_results.min(MAX_RESULTS_CAP).max(1) as usize;
        outcome.matches.truncate(cap);
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("cache", &self.cache)
            .field("fallback_to_exact", &self.fallback_to_exact)
            .finish()
    }
}

/// Base confidence for a fuzzy match: best string similarity against the
/// symbol and the company name, scaled to at most 0.9.
fn fuzzy_base_confidence(input_lower: &str, m: &SymbolMatch) -> f64 {
    let sym = strsim::jaro_winkler(input_lower, &m.symbol.to_lowercase());
    let name = m
        .name
        .as_ref()
        .map(|n| strsim::jaro_winkler(input_lower, &n.to_lowercase()))
        .unwrap_or(0.0);
    (sym.max(name) * 0.9).clamp(0.0, 0.9)
}

fn score_match(
    m: &SymbolMatch,
    query: &ResolutionQuery,
    raw_upper: &str,
    raw_lower: &str,
) -> f64 {
    // Alternative-id matches carry a fixed confidence.
    if m.resolution_method == ResolutionMethod::AlternativeId {
        return 0.95;
    }

    let mut c = match m.resolution_method {
        ResolutionMethod::ExactSymbol | ResolutionMethod::ExchangeAlias => 0.5,
        ResolutionMethod::SmartFallback => 0.4,
        ResolutionMethod::Fuzzy => m.confidence,
        ResolutionMethod::AlternativeId => unreachable!(),
    };

    if m.symbol == raw_upper {
        c += 0.4;
    }
    if let Some(hint) = &query.exchange_hint {
        if m.exchange.eq_ignore_ascii_case(hint) {
            c += 0.2;
        }
    }
    if m.primary_exchange.as_deref() == Some(m.exchange.as_str()) {
        c += 0.15;
    }
    if let Some(hint) = &query.currency_hint {
        if m.currency.eq_ignore_ascii_case(hint) {
            c += 0.1;
        }
    }
    if m.resolution_method == ResolutionMethod::Fuzzy {
        if let Some(name) = &m.name {
            c += 0.3 * strsim::jaro_winkler(raw_lower, &name.to_lowercase());
        }
    }

    c.clamp(0.0, 1.0)
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
