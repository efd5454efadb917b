use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{format_amount, Chain};

/// Category of a holding as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletItemType {
    Wallet,
    LiquidityPool,
    LendingAndBorrowing,
    Staking,
    Locking,
    Other,
}

impl WalletItemType {
    fn key_part(&self) -> &'static str {
        match self {
            WalletItemType::Wallet => "wallet",
            WalletItemType::LiquidityPool => "liquiditypool",
            WalletItemType::LendingAndBorrowing => "lendingandborrowing",
            WalletItemType::Staking => "staking",
            WalletItemType::Locking => "locking",
            WalletItemType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    Held,
    Supplied,
    Borrowed,
    Liquidity,
    UncollectedFee,
    Reward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub id: String,
    pub name: String,
    pub chain: Chain,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub logo: Option<String>,
}

impl Protocol {
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.chain.slug(), self.id, self.name).to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(default)]
    pub token_type: Option<TokenType>,
    #[serde(default)]
    pub name: String,
    pub symbol: String,
    pub chain: Chain,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub decimal_places: Option<u32>,
    /// Raw integer amount as reported on-chain
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub formatted_amount: Option<Decimal>,
    /// USD unit price
    #[serde(default)]
    pub price: Option<Decimal>,
    /// USD value of the whole holding
    #[serde(default)]
    pub total_price: Option<Decimal>,
    #[serde(default)]
    pub logo: Option<String>,
}

impl Token {
    pub fn key(&self) -> String {
        let token_type = self
            .token_type
            .map(|t| format!("{:?}", t))
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}",
            self.chain.slug(),
            self.contract_address,
            self.symbol,
            token_type
        )
        .to_lowercase()
    }

    /// Formatted amount, falling back to the raw amount scaled by decimals
    pub fn resolved_amount(&self) -> Option<Decimal> {
        self.formatted_amount.or_else(|| {
            let raw = self.amount.as_deref()?;
            format_amount(raw, self.decimal_places.unwrap_or(0))
        })
    }

    pub fn has_price(&self) -> bool {
        matches!(self.price, Some(price) if price > Decimal::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub label: String,
    #[serde(default)]
    pub tokens: Vec<Token>,
}

impl Position {
    /// Label plus the sorted token keys, so the same position reported by two
    /// providers in different token order still collides
    pub fn key(&self) -> String {
        let mut token_keys: Vec<String> = self.tokens.iter().map(Token::key).collect();
        token_keys.sort();
        token_keys.dedup();
        format!("{}|{}", self.label.to_lowercase(), token_keys.join(","))
    }

    /// Collapse tokens sharing a key; the last occurrence wins
    pub fn dedup_tokens(&mut self) {
        let mut seen: Vec<String> = Vec::with_capacity(self.tokens.len());
        let mut unique: Vec<Token> = Vec::with_capacity(self.tokens.len());
        for token in self.tokens.drain(..) {
            let key = token.key();
            match seen.iter().position(|k| *k == key) {
                Some(index) => unique[index] = token,
                None => {
                    seen.push(key);
                    unique.push(token);
                }
            }
        }
        self.tokens = unique;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRange {
    pub lower: Decimal,
    pub upper: Decimal,
    pub current: Decimal,
    pub in_range: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalData {
    #[serde(default)]
    pub health_factor: Option<Decimal>,
    #[serde(default)]
    pub range: Option<PositionRange>,
    #[serde(default)]
    pub apr: Option<Decimal>,
    #[serde(default)]
    pub unlock_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletItem {
    #[serde(rename = "type")]
    pub item_type: WalletItemType,
    pub protocol: Protocol,
    pub position: Position,
    #[serde(default)]
    pub additional_data: Option<AdditionalData>,
}

impl WalletItem {
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.item_type.key_part(),
            self.protocol.key(),
            self.position.key()
        )
    }

    pub fn chain(&self) -> Chain {
        self.protocol.chain
    }
}

/// Merged snapshot of everything the providers reported for a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletResponse {
    pub accounts: Vec<String>,
    pub items: Vec<WalletItem>,
    /// Provider slugs whose request ended in `Failed`/`Cancelled`
    #[serde(default)]
    pub failed_providers: Vec<String>,
    /// Provider slugs that never answered before the deadline
    #[serde(default)]
    pub timed_out_providers: Vec<String>,
    #[serde(default)]
    pub unpriced_symbols: Vec<String>,
}

impl WalletResponse {
    /// Sum of priced non-borrowed holdings, saturating at `Decimal::MAX`
    pub fn total_value_usd(&self) -> Decimal {
        self.items
            .iter()
            .flat_map(|item| item.position.tokens.iter())
            .filter(|token| token.token_type != Some(TokenType::Borrowed))
            .filter_map(|token| token.total_price)
            .fold(Decimal::ZERO, |total, value| total.saturating_add(value))
    }

    pub fn tokens_mut(&mut self) -> impl Iterator<Item = &mut Token> {
        self.items
            .iter_mut()
            .flat_map(|item| item.position.tokens.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn token(symbol: &str, address: &str) -> Token {
        Token {
            token_type: Some(TokenType::Supplied),
            name: symbol.to_string(),
            symbol: symbol.to_string(),
            chain: Chain::Ethereum,
            contract_address: address.to_string(),
            decimal_places: Some(6),
            amount: Some("2500000".to_string()),
            formatted_amount: None,
            price: None,
            total_price: None,
            logo: None,
        }
    }

    #[test]
    fn test_token_key_is_case_insensitive() {
        let a = token("USDC", "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        let b = token("usdc", "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_position_key_ignores_token_order() {
        let first = Position {
            label: "Aave".to_string(),
            tokens: vec![token("USDC", "0x1"), token("WETH", "0x2")],
        };
        let second = Position {
            label: "aave".to_string(),
            tokens: vec![token("WETH", "0x2"), token("USDC", "0x1")],
        };
        assert_eq!(first.key(), second.key());
    }

    #[test]
    fn test_dedup_tokens_last_write_wins() {
        let mut stale = token("USDC", "0x1");
        stale.price = Some(dec!(0.99));
        let mut fresh = token("USDC", "0x1");
        fresh.price = Some(dec!(1.00));
        let mut position = Position {
            label: "Wallet".to_string(),
            tokens: vec![stale, token("WETH", "0x2"), fresh],
        };
        position.dedup_tokens();
        assert_eq!(position.tokens.len(), 2);
        assert_eq!(position.tokens[0].price, Some(dec!(1.00)));
    }

    #[test]
    fn test_resolved_amount_uses_decimals() {
        assert_eq!(token("USDC", "0x1").resolved_amount(), Some(dec!(2.5)));
    }

    #[test]
    fn test_total_value_saturates_instead_of_overflowing() {
        let mut big = token("USDC", "0x1");
        big.total_price = Some(Decimal::MAX);
        let mut more = token("WETH", "0x2");
        more.total_price = Some(dec!(1));
        let mut debt = token("DAI", "0x3");
        debt.token_type = Some(TokenType::Borrowed);
        debt.total_price = Some(dec!(50));
        let response = WalletResponse {
            accounts: vec!["0xabc".to_string()],
            items: vec![WalletItem {
                item_type: WalletItemType::Wallet,
                protocol: Protocol {
                    id: "wallet".to_string(),
                    name: "Wallet".to_string(),
                    chain: Chain::Ethereum,
                    url: None,
                    logo: None,
                },
                position: Position {
                    label: "Wallet".to_string(),
                    tokens: vec![big, more, debt],
                },
                additional_data: None,
            }],
            failed_providers: Vec::new(),
            timed_out_providers: Vec::new(),
            unpriced_symbols: Vec::new(),
        };
        assert_eq!(response.total_value_usd(), Decimal::MAX);
    }

    #[test]
    fn test_wallet_item_deserializes_camel_case() {
        let json = r#"{
            "type": "LendingAndBorrowing",
            "protocol": { "id": "aave-v3", "name": "Aave V3", "chain": "base" },
            "position": {
                "label": "Supplied",
                "tokens": [{ "symbol": "USDC", "chain": "base", "formattedAmount": "10.5", "price": "1" }]
            },
            "additionalData": { "healthFactor": "1.8" }
        }"#;
        let item: WalletItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.chain(), Chain::Base);
        assert_eq!(item.position.tokens[0].formatted_amount, Some(dec!(10.5)));
        assert_eq!(
            item.additional_data.unwrap().health_factor,
            Some(dec!(1.8))
        );
    }
}
