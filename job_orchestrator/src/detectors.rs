use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};
use wallet_core::{Chain, IntegrationProvider};

/// A follow-up request some result calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trigger {
    pub provider: IntegrationProvider,
    pub chain: Chain,
}

impl Trigger {
    pub fn new(provider: IntegrationProvider, chain: Chain) -> Self {
        Self { provider, chain }
    }
}

/// Inspects the payload of one provider's successful result and reports
/// which further providers should be queried. Implementations must be pure
/// and return an empty list for anything they do not understand.
pub trait TriggerDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles_provider(&self) -> IntegrationProvider;

    fn detect_triggers(&self, payload: &Value, chain: Chain) -> Vec<Trigger>;
}

const AMOUNT_FIELDS: [&str; 3] = ["amount", "balance", "formattedAmount"];
const DECIMALS_FIELDS: [&str; 2] = ["decimalPlaces", "decimals"];
const CONTRACT_FIELDS: [&str; 4] = ["contractAddress", "tokenAddress", "token_address", "address"];
const FORMATTED_AMOUNT_FIELDS: [&str; 4] = ["formattedAmount", "balance_formatted", "amount", "balance"];

/// Call `visit` for every JSON object in `value`, depth first
fn visit_objects<'a>(value: &'a Value, visit: &mut dyn FnMut(&'a Map<String, Value>)) {
    match value {
        Value::Object(map) => {
            visit(map);
            for child in map.values() {
                visit_objects(child, visit);
            }
        }
        Value::Array(values) => {
            for child in values {
                visit_objects(child, visit);
            }
        }
        _ => {}
    }
}

fn field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| object.get(*name).filter(|v| !v.is_null()))
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

fn text<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    object.get(name).and_then(Value::as_str)
}

/// `amount == 1` and `decimals == 0`: the shape of an NFT holding
fn is_single_unit(object: &Map<String, Value>) -> bool {
    let amount = field(object, &AMOUNT_FIELDS).and_then(as_decimal);
    let decimals = field(object, &DECIMALS_FIELDS).and_then(as_decimal);
    amount == Some(Decimal::ONE) && decimals == Some(Decimal::ZERO)
}

/// Uniswap V3 LP positions are NFTs minted by the chain's position manager
pub struct UniswapV3PositionDetector {
    position_managers: HashMap<Chain, String>,
}

impl UniswapV3PositionDetector {
    pub fn new(position_managers: HashMap<Chain, String>) -> Self {
        let position_managers = position_managers
            .into_iter()
            .map(|(chain, address)| (chain, address.to_lowercase()))
            .collect();
        Self { position_managers }
    }
}

impl TriggerDetector for UniswapV3PositionDetector {
    fn name(&self) -> &'static str {
        "uniswap-v3-position-nft"
    }

    fn handles_provider(&self) -> IntegrationProvider {
        IntegrationProvider::MoralisNfts
    }

    fn detect_triggers(&self, payload: &Value, chain: Chain) -> Vec<Trigger> {
        let Some(manager) = self.position_managers.get(&chain) else {
            return Vec::new();
        };

        let mut found = false;
        visit_objects(payload, &mut |object| {
            if found || !is_single_unit(object) {
                return;
            }
            found = field(object, &CONTRACT_FIELDS)
                .and_then(Value::as_str)
                .is_some_and(|contract| contract.to_lowercase() == *manager);
        });

        if found {
            vec![Trigger::new(IntegrationProvider::UniswapV3Positions, chain)]
        } else {
            Vec::new()
        }
    }
}

pub struct RaydiumClmmPositionDetector;

impl RaydiumClmmPositionDetector {
    const POSITION_SYMBOL: &'static str = "RCL";
    const POSITION_NAME: &'static str = "raydium concentrated liquidity";
}

impl TriggerDetector for RaydiumClmmPositionDetector {
    fn name(&self) -> &'static str {
        "raydium-clmm-position-nft"
    }

    fn handles_provider(&self) -> IntegrationProvider {
        IntegrationProvider::SolanaTokens
    }

    fn detect_triggers(&self, payload: &Value, chain: Chain) -> Vec<Trigger> {
        if chain != Chain::Solana {
            return Vec::new();
        }

        let mut found = false;
        visit_objects(payload, &mut |object| {
            if found || !is_single_unit(object) {
                return;
            }
            let symbol_match = text(object, "symbol")
                .is_some_and(|s| s.trim().eq_ignore_ascii_case(Self::POSITION_SYMBOL));
            let name_match = text(object, "name")
                .is_some_and(|n| n.to_lowercase().contains(Self::POSITION_NAME));
            found = symbol_match || name_match;
        });

        if found {
            vec![Trigger::new(IntegrationProvider::RaydiumClmmPositions, Chain::Solana)]
        } else {
            Vec::new()
        }
    }
}

/// Aave V3 supply/borrow receipts (`aEthWETH`, `variableDebtEthUSDC`) in a
/// plain token balance mean the account has a lending position
pub struct AaveV3ReserveDetector;

impl AaveV3ReserveDetector {
    fn is_receipt_symbol(symbol: &str, name: Option<&str>) -> bool {
        let uppercase_after = |rest: &str| rest.chars().next().is_some_and(|c| c.is_ascii_uppercase());

        if let Some(rest) = symbol.strip_prefix("variableDebt") {
            return uppercase_after(rest);
        }
        if let Some(rest) = symbol.strip_prefix('a') {
            // a bare `aXYZ` ticker is too common to trust without the Aave name
            return uppercase_after(rest) && name.map_or(true, |n| n.to_lowercase().contains("aave"));
        }
        false
    }
}

impl TriggerDetector for AaveV3ReserveDetector {
    fn name(&self) -> &'static str {
        "aave-v3-receipt-token"
    }

    fn handles_provider(&self) -> IntegrationProvider {
        IntegrationProvider::MoralisTokens
    }

    fn detect_triggers(&self, payload: &Value, chain: Chain) -> Vec<Trigger> {
        if !chain.is_evm() {
            return Vec::new();
        }

        let mut found = false;
        visit_objects(payload, &mut |object| {
            if found {
                return;
            }
            let Some(symbol) = text(object, "symbol") else {
                return;
            };
            if !Self::is_receipt_symbol(symbol, text(object, "name")) {
                return;
            }
            found = field(object, &FORMATTED_AMOUNT_FIELDS)
                .and_then(as_decimal)
                .is_some_and(|balance| balance > Decimal::ZERO);
        });

        if found {
            vec![Trigger::new(IntegrationProvider::AaveV3Positions, chain)]
        } else {
            Vec::new()
        }
    }
}

/// Detectors grouped by the provider whose results they inspect
#[derive(Default, Clone)]
pub struct DetectorRegistry {
    detectors: HashMap<IntegrationProvider, Vec<Arc<dyn TriggerDetector>>>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All shipped detectors
    pub fn with_defaults(position_managers: HashMap<Chain, String>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UniswapV3PositionDetector::new(position_managers)));
        registry.register(Arc::new(RaydiumClmmPositionDetector));
        registry.register(Arc::new(AaveV3ReserveDetector));
        registry
    }

    pub fn register(&mut self, detector: Arc<dyn TriggerDetector>) {
        self.detectors
            .entry(detector.handles_provider())
            .or_default()
            .push(detector);
    }

    pub fn detectors_for(&self, provider: IntegrationProvider) -> &[Arc<dyn TriggerDetector>] {
        self.detectors.get(&provider).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Run every detector registered for `provider`; duplicates are dropped,
    /// first occurrence order is kept. A detector that panics contributes
    /// nothing and the others still run.
    pub fn detect(&self, provider: IntegrationProvider, payload: &Value, chain: Chain) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = Vec::new();
        for detector in self.detectors_for(provider) {
            let found = match catch_unwind(AssertUnwindSafe(|| detector.detect_triggers(payload, chain))) {
                Ok(found) => found,
                Err(_) => {
                    error!("Detector {} panicked on {} ({}), skipping it", detector.name(), provider, chain);
                    continue;
                }
            };
            if !found.is_empty() {
                debug!("Detector {} fired on {} ({}): {:?}", detector.name(), provider, chain, found);
            }
            for trigger in found {
                if !triggers.contains(&trigger) {
                    triggers.push(trigger);
                }
            }
        }
        triggers
    }
}
