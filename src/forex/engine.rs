// =============================================================================
// Forex Engine: rate retrieval and currency conversion
// =============================================================================
//
// Conversion resolution order:
//   1. identity        from == to, rate 1
//   2. direct          FROMTO is a supported pair
//   3. inverse         TOFROM is a supported pair, rate = 1 / quote
//   4. cross via USD   FROM -> USD -> TO using two supported-pair lookups
//
// Rates come from the cache (5 s TTL) or a broker snapshot. Unusable
// upstream quotes degrade to the deterministic mock table; the rate source
// is reported on every response so callers can tell.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::forex::cache::{self, ForexCache, ForexRate, RateSource};
use crate::ibkr::contracts::Contract;
use crate::ibkr::session::BrokerSession;

/// How a conversion was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversionMethod {
    /// Same currency on both sides; no rate lookup.
    Identity,
    Direct,
    Inverse,
    #[serde(rename = "CrossViaUSD")]
    CrossViaUsd,
}

/// Full conversion response.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub original_amount: f64,
    pub converted_amount: f64,
    pub exchange_rate: f64,
    pub from_currency: String,
    pub to_currency: String,
    /// Pair(s) consulted; cross conversions list both legs.
    pub pair_used: String,
    pub conversion_method: ConversionMethod,
    pub rate_source: RateSource,
}

pub struct ForexEngine {
    session: Arc<BrokerSession>,
    cache: Arc<ForexCache>,
    /// Convert on the bid/ask midpoint instead of the bid.
    use_mid: bool,
}

impl ForexEngine {
    pub fn new(session: Arc<BrokerSession>, cache: Arc<ForexCache>, use_mid: bool) -> Self {
        Self {
            session,
            cache,
            use_mid,
        }
    }

    // -------------------------------------------------------------------------
    // Rates
    // -------------------------------------------------------------------------

    /// Current rate for a supported pair, from cache or a fresh snapshot.
    pub async fn get_rate(&self, pair: &str) -> Result<ForexRate, GatewayError> {
        let pair = pair.to_ascii_uppercase();

        if let Some(rate) = self.cache.get(&pair) {
            debug!(pair = %pair, "forex cache hit");
            return Ok(rate);
        }

        if !cache::is_supported_pair(&pair) {
            let (base, quote) = pair.split_at(3);
            return Err(GatewayError::NoRateAvailable {
                from: base.to_string(),
                to: quote.to_string(),
            });
        }

        let tickers = self
            .session
            .req_tickers(vec![Contract::forex(&pair)])
            .await?;
        let ticker = tickers.into_iter().next();

        let rate = match ticker {
            // A crossed book (bid above ask) is as unusable as a NaN.
            Some(t) if usable(t.bid) && usable(t.ask) && usable(t.last) && t.bid <= t.ask => {
                ForexRate {
                    pair: pair.clone(),
                    bid: t.bid,
                    ask: t.ask,
                    last: t.last,
                    close: t.close,
                    timestamp: t.timestamp,
                    source: RateSource::Live,
                }
            }
            _ => {
                warn!(pair = %pair, "unusable upstream quote, substituting mock rate");
                cache::mock_rate(&pair).ok_or_else(|| {
                    let (base, quote) = pair.split_at(3);
                    GatewayError::NoRateAvailable {
                        from: base.to_string(),
                        to: quote.to_string(),
                    }
                })?
            }
        };

        self.cache.insert(rate.clone());
        Ok(rate)
    }

    /// Rates for several pairs. Fails on the first unsupported pair.
    pub async fn get_rates(&self, pairs: &[String]) -> Result<Vec<ForexRate>, GatewayError> {
        let mut out = Vec::with_capacity(pairs.len());
        for pair in pairs {
            out.push(self.get_rate(pair).await?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Conversion
    // -------------------------------------------------------------------------

    pub async fn convert(
        &self,
        amount: f64,
        from: &str,
        to: &str,
    ) -> Result<ConversionResult, GatewayError> {
        let from = from.to_ascii_uppercase();
        let to = to.to_ascii_uppercase();

        if from == to {
            return Ok(ConversionResult {
                original_amount: amount,
                converted_amount: amount,
                exchange_rate: 1.0,
                pair_used: format!("{from}{to}"),
                from_currency: from,
                to_currency: to,
                conversion_method: ConversionMethod::Identity,
                rate_source: RateSource::Live,
            });
        }

        let direct_pair = format!("{from}{to}");
        let inverse_pair = format!("{to}{from}");

        let (rate, pair_used, method, source) = if cache::is_supported_pair(&direct_pair) {
            let quote = self.get_rate(&direct_pair).await?;
            (
                self.conversion_rate(&quote),
                direct_pair,
                ConversionMethod::Direct,
                quote.source,
            )
        } else if cache::is_supported_pair(&inverse_pair) {
            let quote = self.get_rate(&inverse_pair).await?;
            (
                1.0 / self.conversion_rate(&quote),
                inverse_pair,
                ConversionMethod::Inverse,
                quote.source,
            )
        } else {
            // Cross conversion through USD: FROM -> USD, then USD -> TO.
            let (to_usd, leg1_pair, leg1_source) = self.rate_into_usd(&from).await?;
            let (from_usd, leg2_pair, leg2_source) = self.rate_from_usd(&to).await?;
            let source = if leg1_source == RateSource::MockFallback
                || leg2_source == RateSource::MockFallback
            {
                RateSource::MockFallback
            } else {
                RateSource::Live
            };
            (
                to_usd * from_usd,
                format!("{leg1_pair},{leg2_pair}"),
                ConversionMethod::CrossViaUsd,
                source,
            )
        };

        let converted = amount * rate;
        debug!(
            amount,
            from = %from,
            to = %to,
            rate,
            method = ?method,
            "currency conversion"
        );

        Ok(ConversionResult {
            original_amount: amount,
            converted_amount: converted,
            exchange_rate: rate,
            from_currency: from,
            to_currency: to,
            pair_used,
            conversion_method: method,
            rate_source: source,
        })
    }

    /// Quick USD estimate for order-notional checks. Uses only the cache and
    /// the mock table: estimation runs before safety validation, which must
    /// not trigger broker traffic for an operation that may be rejected.
    pub fn estimate_usd(&self, amount: f64, currency: &str) -> Option<f64> {
        let currency = currency.to_ascii_uppercase();
        if currency == "USD" {
            return Some(amount);
        }
        let direct = format!("{currency}USD");
        let inverse = format!("USD{currency}");
        if let Some(rate) = self.cache.get(&direct) {
            return Some(amount * rate.bid);
        }
        if let Some(rate) = self.cache.get(&inverse) {
            return Some(amount / rate.ask);
        }
        cache::mock_rate(&direct)
            .map(|r| amount * r.bid)
            .or_else(|| cache::mock_rate(&inverse).map(|r| amount / r.ask))
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn conversion_rate(&self, rate: &ForexRate) -> f64 {
        if self.use_mid {
            (rate.bid + rate.ask) / 2.0
        } else {
            rate.bid
        }
    }

    /// Multiplier converting `currency` into USD, with the pair consulted.
    async fn rate_into_usd(
        &self,
        currency: &str,
    ) -> Result<(f64, String, RateSource), GatewayError> {
        if currency == "USD" {
            return Ok((1.0, "USDUSD".to_string(), RateSource::Live));
        }
        let direct = format!("{currency}USD");
        if cache::is_supported_pair(&direct) {
            let quote = self.get_rate(&direct).await?;
            return Ok((self.conversion_rate(&quote), direct, quote.source));
        }
        let inverse = format!("USD{currency}");
        if cache::is_supported_pair(&inverse) {
            let quote = self.get_rate(&inverse).await?;
            return Ok((1.0 / self.conversion_rate(&quote), inverse, quote.source));
        }
        Err(GatewayError::NoRateAvailable {
            from: currency.to_string(),
            to: "USD".to_string(),
        })
    }

    /// Multiplier converting USD into `currency`, with the pair consulted.
    async fn rate_from_usd(
        &self,
        currency: &str,
    ) -> Result<(f64, String, RateSource), GatewayError> {
        if currency == "USD" {
            return Ok((1.0, "USDUSD".to_string(), RateSource::Live));
        }
        let direct = format!("USD{currency}");
        if cache::is_supported_pair(&direct) {
            let quote = self.get_rate(&direct).await?;
            return Ok((self.conversion_rate(&quote), direct, quote.source));
        }
        let inverse = format!("{currency}USD");
        if cache::is_supported_pair(&inverse) {
            let quote = self.get_rate(&inverse).await?;
            return Ok((1.0 / self.conversion_rate(&quote), inverse, quote.source));
        }
        Err(GatewayError::NoRateAvailable {
            from: "USD".to_string(),
            to: currency.to_string(),
        })
    }
}

impl std::fmt::Debug for ForexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForexEngine")
            .field("use_mid", &self.use_mid)
            .field("cache", &self.cache)
            .finish()
    }
}

// Reject NaN, infinities, and non-positive prices.
fn usable(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::forex::cache::ForexCache;
    use crate::ibkr::testing::MockBroker;

    async fn engine_with(mock: Arc<MockBroker>) -> ForexEngine {
        let session = BrokerSession::new(mock, 1, "s-forex".to_string());
        session.connect().await.unwrap();
        ForexEngine::new(session, Arc::new(ForexCache::new()), false)
    }

    #[tokio::test]
    async fn identity_conversion_is_exact() {
        let mock = Arc::new(MockBroker::new("DU1"));
        let engine = engine_with(mock).await;

        let result = engine.convert(123.45, "EUR", "EUR").await.unwrap();
        assert_eq!(result.conversion_method, ConversionMethod::Identity);
        assert!((result.exchange_rate - 1.0).abs() < 1e-12);
        assert!((result.converted_amount - 123.45).abs() < 1e-12);
    }

    #[tokio::test]
    async fn direct_conversion_uses_bid() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0848, 1.0852, 1.0850, 1.0840);
        let engine = engine_with(mock).await;

        let result = engine.convert(100.0, "EUR", "USD").await.unwrap();
        assert_eq!(result.conversion_method, ConversionMethod::Direct);
        assert_eq!(result.pair_used, "EURUSD");
        assert_eq!(result.rate_source, RateSource::Live);
        assert!((result.converted_amount - 108.48).abs() < 1e-9);
    }

    #[tokio::test]
    async fn inverse_conversion_inverts_the_quote() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0848, 1.0852, 1.0850, 1.0840);
        let engine = engine_with(mock).await;

        let result = engine.convert(108.48, "USD", "EUR").await.unwrap();
        assert_eq!(result.conversion_method, ConversionMethod::Inverse);
        assert_eq!(result.pair_used, "EURUSD");
        assert!((result.converted_amount - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cross_conversion_goes_via_usd() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0850, 1.0854, 1.0852, 1.0840);
        mock.set_quote("GBPUSD", 1.2650, 1.2654, 1.2652, 1.2640);
        let engine = engine_with(mock).await;

        let result = engine.convert(500.0, "EUR", "GBP").await.unwrap();
        assert_eq!(result.conversion_method, ConversionMethod::CrossViaUsd);
        assert!(result.pair_used.contains("EURUSD"));
        assert!(result.pair_used.contains("GBPUSD"));
        assert_eq!(result.rate_source, RateSource::Live);

        // EUR -> USD at 1.0850, USD -> GBP at 1/1.2650.
        let expected = 500.0 * 1.0850 / 1.2650;
        assert!((result.converted_amount - expected).abs() < 1e-9);

        // Serialized method matches the documented name.
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["conversion_method"], "CrossViaUSD");
    }

    #[tokio::test]
    async fn round_trip_is_consistent() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0850, 1.0854, 1.0852, 1.0840);
        mock.set_quote("GBPUSD", 1.2650, 1.2654, 1.2652, 1.2640);
        let engine = engine_with(mock).await;

        let there = engine.convert(500.0, "EUR", "GBP").await.unwrap();
        let back = engine.convert(1.0, "GBP", "EUR").await.unwrap();
        let round_trip = there.converted_amount * back.exchange_rate;
        assert!((round_trip - 500.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn non_finite_quotes_fall_back_to_mock() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", f64::NAN, f64::NAN, f64::NAN, f64::NAN);
        let engine = engine_with(mock).await;

        let rate = engine.get_rate("EURUSD").await.unwrap();
        assert_eq!(rate.source, RateSource::MockFallback);
        assert!(rate.bid < rate.ask);
        assert!(rate.bid > 0.0);
    }

    #[tokio::test]
    async fn unsupported_pair_yields_no_rate() {
        let mock = Arc::new(MockBroker::new("DU1"));
        let engine = engine_with(mock).await;

        let err = engine.get_rate("EURGBP").await.unwrap_err();
        assert_eq!(err.kind(), "NoRateAvailable");

        let err = engine.convert(10.0, "EUR", "XXX").await.unwrap_err();
        match err {
            GatewayError::NoRateAvailable { from, to } => {
                assert_eq!(from, "USD");
                assert_eq!(to, "XXX");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rates_are_cached_within_ttl() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0848, 1.0852, 1.0850, 1.0840);
        let engine = engine_with(mock.clone()).await;

        engine.get_rate("EURUSD").await.unwrap();
        engine.get_rate("EURUSD").await.unwrap();
        engine.get_rate("EURUSD").await.unwrap();
        assert_eq!(
            mock.ticker_calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn estimate_usd_never_touches_the_broker() {
        let mock = Arc::new(MockBroker::new("DU1"));
        let engine = engine_with(mock.clone()).await;

        // USD is identity; EUR falls back to the mock table.
        assert_eq!(engine.estimate_usd(100.0, "USD"), Some(100.0));
        let eur = engine.estimate_usd(100.0, "EUR").unwrap();
        assert!(eur > 100.0, "EUR should be worth more than USD in the seed table");
        // JPY goes through the inverse pair.
        let jpy = engine.estimate_usd(14850.0, "JPY").unwrap();
        assert!((jpy - 100.0).abs() < 1.0);
        assert_eq!(
            mock.ticker_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn mid_mode_uses_midpoint() {
        let mock = Arc::new(MockBroker::new("DU1"));
        mock.set_quote("EURUSD", 1.0000, 1.2000, 1.1000, 1.1000);
        let session = BrokerSession::new(mock, 1, "s-forex".to_string());
        session.connect().await.unwrap();
        let engine = ForexEngine::new(session, Arc::new(ForexCache::new()), true);

        let result = engine.convert(100.0, "EUR", "USD").await.unwrap();
        assert!((result.exchange_rate - 1.1).abs() < 1e-9);
    }
}
