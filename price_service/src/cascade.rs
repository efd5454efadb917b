use config_manager::PriceConfig;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use wallet_core::{Chain, WalletItem};

use crate::{PriceCache, QuoteProvider};

/// Which cascade layer produced a token's price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PriceSource {
    Existing,
    Peer,
    Cache,
    Quote,
    WrapperBase,
    Derived,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResolutionReport {
    pub resolved: BTreeMap<PriceSource, usize>,
    /// Distinct symbols left without a price
    pub unresolved: Vec<String>,
}

impl PriceResolutionReport {
    pub fn count(&self, source: PriceSource) -> usize {
        self.resolved.get(&source).copied().unwrap_or(0)
    }

    pub fn total_resolved(&self) -> usize {
        self.resolved.values().sum()
    }
}

/// Base symbol of a wrapped/staked token, e.g. `stSOL` -> `SOL`, `veCRV` -> `CRV`.
/// The prefix must be followed by an uppercase letter or digit so ordinary
/// tickers such as `STEP` or `vet` are left alone.
pub fn strip_wrapper_prefix<'a>(symbol: &'a str, prefixes: &[String]) -> Option<&'a str> {
    let mut ordered: Vec<&String> = prefixes.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.len()));

    ordered.into_iter().find_map(|prefix| {
        let rest = symbol.strip_prefix(prefix.as_str())?;
        let first = rest.chars().next()?;
        (first.is_ascii_uppercase() || first.is_ascii_digit()).then_some(rest)
    })
}

struct Slot {
    item: usize,
    token: usize,
    symbol: String,
    lower: String,
    chain: Chain,
    excluded: bool,
    amount: Option<Decimal>,
    total: Option<Decimal>,
    resolved: Option<(Decimal, PriceSource)>,
}

fn average(prices: &[Decimal]) -> Option<Decimal> {
    if prices.is_empty() {
        return None;
    }
    let sum = prices
        .iter()
        .try_fold(Decimal::ZERO, |sum, price| sum.checked_add(*price))?;
    sum.checked_div(Decimal::from(prices.len()))
}

pub struct PriceService {
    config: PriceConfig,
    cache: Arc<dyn PriceCache>,
    quotes: Option<Arc<dyn QuoteProvider>>,
}

impl PriceService {
    pub fn new(
        config: PriceConfig,
        cache: Arc<dyn PriceCache>,
        quotes: Option<Arc<dyn QuoteProvider>>,
    ) -> Self {
        Self {
            config,
            cache,
            quotes,
        }
    }

    fn is_excluded(&self, protocol_id: &str) -> bool {
        self.config
            .excluded_peer_sources
            .iter()
            .any(|source| source.eq_ignore_ascii_case(protocol_id))
    }

    fn base_symbol(&self, lower_or_symbol: &str) -> Option<String> {
        strip_wrapper_prefix(lower_or_symbol, &self.config.wrapper_prefixes).map(str::to_lowercase)
    }

    /// Fill in missing USD prices across `items`. Never fails: every layer
    /// that errors is skipped and its tokens fall through to the next one.
    pub async fn resolve_prices(&self, items: &mut [WalletItem]) -> PriceResolutionReport {
        let mut slots = Vec::new();
        for (item_index, item) in items.iter().enumerate() {
            let excluded = self.is_excluded(&item.protocol.id);
            for (token_index, token) in item.position.tokens.iter().enumerate() {
                let resolved = token
                    .price
                    .filter(|_| token.has_price())
                    .map(|price| (price, PriceSource::Existing));
                slots.push(Slot {
                    item: item_index,
                    token: token_index,
                    symbol: token.symbol.clone(),
                    lower: token.symbol.to_lowercase(),
                    chain: token.chain,
                    excluded,
                    amount: token.resolved_amount(),
                    total: token.total_price,
                    resolved,
                });
            }
        }

        self.infer_from_peers(&mut slots);
        self.apply_cache(&mut slots).await;
        self.apply_quotes(&mut slots).await;
        self.apply_heuristics(&mut slots).await;

        let mut report = PriceResolutionReport::default();
        let mut unresolved = BTreeSet::new();
        for slot in &slots {
            let token = &mut items[slot.item].position.tokens[slot.token];
            match slot.resolved {
                Some((price, source)) => {
                    *report.resolved.entry(source).or_insert(0) += 1;
                    token.price = Some(price);
                    if token.formatted_amount.is_none() {
                        token.formatted_amount = slot.amount;
                    }
                    if token.total_price.is_none() {
                        // an unrepresentable value stays unset
                        token.total_price = slot.amount.and_then(|amount| price.checked_mul(amount));
                    }
                }
                None => {
                    unresolved.insert(slot.symbol.clone());
                }
            }
        }
        report.unresolved = unresolved.into_iter().collect();

        info!(
            "Price resolution: {} resolved, {} symbols unpriced",
            report.total_resolved(),
            report.unresolved.len()
        );
        report
    }

    fn infer_from_peers(&self, slots: &mut [Slot]) {
        let mut peers: HashMap<(String, Chain), Vec<Decimal>> = HashMap::new();
        for slot in slots.iter().filter(|s| !s.excluded) {
            if let Some((price, _)) = slot.resolved {
                peers.entry((slot.lower.clone(), slot.chain)).or_default().push(price);
            }
        }
        if peers.is_empty() {
            return;
        }

        for slot in slots.iter_mut() {
            if slot.resolved.is_some() || slot.excluded {
                continue;
            }
            if !matches!(slot.amount, Some(amount) if amount > Decimal::ZERO) {
                continue;
            }

            let direct = peers.get(&(slot.lower.clone(), slot.chain));
            let via_base = || {
                let base = self.base_symbol(&slot.symbol)?;
                peers.get(&(base, slot.chain))
            };
            if let Some(price) = direct.or_else(via_base).and_then(|p| average(p)) {
                debug!("Inferred {} on {} from peers: {}", slot.symbol, slot.chain, price);
                slot.resolved = Some((price, PriceSource::Peer));
            }
        }
    }

    fn pending_symbols(slots: &[Slot]) -> Vec<String> {
        slots
            .iter()
            .filter(|s| s.resolved.is_none())
            .map(|s| s.lower.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn apply(slots: &mut [Slot], prices: &HashMap<String, Decimal>, source: PriceSource) {
        for slot in slots.iter_mut().filter(|s| s.resolved.is_none()) {
            if let Some(price) = prices.get(&slot.lower) {
                slot.resolved = Some((*price, source));
            }
        }
    }

    async fn apply_cache(&self, slots: &mut [Slot]) {
        let pending = Self::pending_symbols(slots);
        if pending.is_empty() {
            return;
        }
        match self.cache.get_many(&pending).await {
            Ok(cached) => Self::apply(slots, &cached, PriceSource::Cache),
            Err(e) => warn!("Price cache lookup failed, skipping: {}", e),
        }
    }

    async fn apply_quotes(&self, slots: &mut [Slot]) {
        let Some(quotes) = &self.quotes else {
            return;
        };
        let pending = Self::pending_symbols(slots);
        if pending.is_empty() {
            return;
        }

        let quoted = match quotes.quote(&pending).await {
            Ok(quoted) => quoted,
            Err(e) => {
                warn!("Quote lookup failed for {} symbols: {}", pending.len(), e);
                return;
            }
        };

        let ttl = Duration::from_secs(self.config.quote_ttl_seconds);
        for (symbol, price) in &quoted {
            if let Err(e) = self.cache.set(symbol, *price, ttl).await {
                warn!("Failed to cache quote for {}: {}", symbol, e);
            }
        }
        Self::apply(slots, &quoted, PriceSource::Quote);
    }

    async fn apply_heuristics(&self, slots: &mut [Slot]) {
        let mut by_chain: HashMap<(String, Chain), Vec<Decimal>> = HashMap::new();
        let mut by_symbol: HashMap<String, Vec<Decimal>> = HashMap::new();
        for slot in slots.iter() {
            if let Some((price, _)) = slot.resolved {
                by_chain.entry((slot.lower.clone(), slot.chain)).or_default().push(price);
                by_symbol.entry(slot.lower.clone()).or_default().push(price);
            }
        }

        let mut learned: HashMap<String, Decimal> = HashMap::new();
        for slot in slots.iter_mut().filter(|s| s.resolved.is_none()) {
            let wrapper_price = self.base_symbol(&slot.symbol).and_then(|base| {
                by_chain
                    .get(&(base.clone(), slot.chain))
                    .or_else(|| by_symbol.get(&base))
                    .and_then(|p| average(p))
            });
            if let Some(price) = wrapper_price {
                slot.resolved = Some((price, PriceSource::WrapperBase));
                learned.insert(slot.lower.clone(), price);
                continue;
            }

            if let (Some(total), Some(amount)) = (slot.total, slot.amount) {
                if total > Decimal::ZERO && amount > Decimal::ZERO {
                    if let Some(price) = total.checked_div(amount) {
                        slot.resolved = Some((price, PriceSource::Derived));
                        learned.insert(slot.lower.clone(), price);
                    }
                }
            }
        }

        let ttl = Duration::from_secs(self.config.heuristic_ttl_seconds);
        for (symbol, price) in learned {
            if let Err(e) = self.cache.set(&symbol, price, ttl).await {
                warn!("Failed to cache fallback price for {}: {}", symbol, e);
            }
        }
    }
}
