//! Call-policy permission model.
//!
//! Normalizes client input (string addresses, decimal amounts) into the
//! typed settings the call-policy contract is configured with. Amounts are
//! fixed-point integers in the token's smallest unit; parsing happens only at
//! this boundary and never touches floating point.

use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy_sol_types::{sol, SolValue};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Call type restricting how the delegated key may invoke a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// A single direct call.
    Single,
    /// A batched call.
    Batch,
    /// A delegatecall.
    Delegate,
}

impl CallType {
    /// On-chain encoding byte.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Single => 0x00,
            Self::Batch => 0x01,
            Self::Delegate => 0xff,
        }
    }
}

/// Comparison applied by a parameter rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamCondition {
    Equal,
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    NotEqual,
    OneOf,
}

impl ParamCondition {
    /// On-chain encoding byte.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Equal => 0,
            Self::GreaterThan => 1,
            Self::LessThan => 2,
            Self::GreaterEqual => 3,
            Self::LessEqual => 4,
            Self::NotEqual => 5,
            Self::OneOf => 6,
        }
    }
}

/// A single parameter constraint within a permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRule {
    /// The comparison to apply.
    pub condition: ParamCondition,
    /// Byte offset of the parameter within the call data.
    pub offset: u64,
    /// Comparison operands (one entry, or several for `OneOf`).
    pub params: Vec<B256>,
}

/// One allowed (call type, target, selector) tuple with its rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// How the target may be called.
    pub call_type: CallType,
    /// The contract (or recipient) address.
    pub target: Address,
    /// 4-byte function selector; [`NATIVE_TRANSFER_SELECTOR`] for plain value
    /// transfers.
    pub selector: FixedBytes<4>,
    /// Ordered parameter rules, all of which must hold.
    pub rules: Vec<ParamRule>,
}

/// Per-token spend limits, in the token's smallest unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimit {
    /// The ERC-20 token contract.
    pub token: Address,
    /// Maximum amount per transaction.
    pub tx_limit: U256,
    /// Maximum amount per day. Invariant: `daily_limit >= tx_limit`.
    pub daily_limit: U256,
    /// Whether the limit is active.
    pub enabled: bool,
}

/// Normalized call-policy configuration, ready for installation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPolicySettings {
    /// Allowed (target, selector) permissions.
    pub permissions: Vec<Permission>,
    /// De-duplicated token limits.
    pub token_limits: Vec<TokenLimit>,
    /// De-duplicated allowed ETH recipients.
    pub allowed_recipients: Vec<Address>,
    /// Global per-transaction ETH cap, in wei.
    pub eth_tx_cap: Option<U256>,
    /// Global per-day ETH cap, in wei.
    pub eth_daily_cap: Option<U256>,
}

/// Sentinel selector for native value transfers.
pub const NATIVE_TRANSFER_SELECTOR: FixedBytes<4> = FixedBytes([0x00, 0x00, 0x00, 0x00]);
/// `transfer(address,uint256)`.
pub const ERC20_TRANSFER_SELECTOR: FixedBytes<4> = FixedBytes([0xa9, 0x05, 0x9c, 0xbb]);
/// `approve(address,uint256)`.
pub const ERC20_APPROVE_SELECTOR: FixedBytes<4> = FixedBytes([0x09, 0x5e, 0xa7, 0xb3]);

/// A catalog entry describing a known action. Name and description are
/// cosmetic, never security-relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogAction {
    /// The 4-byte selector.
    pub selector: FixedBytes<4>,
    /// Display name.
    pub name: &'static str,
    /// Display description.
    pub description: &'static str,
}

/// Predefined actions a policy may reference by selector.
pub const ACTION_CATALOG: &[CatalogAction] = &[
    CatalogAction {
        selector: NATIVE_TRANSFER_SELECTOR,
        name: "native transfer",
        description: "send the chain's native asset",
    },
    CatalogAction {
        selector: ERC20_TRANSFER_SELECTOR,
        name: "erc20 transfer",
        description: "transfer an ERC-20 token",
    },
    CatalogAction {
        selector: ERC20_APPROVE_SELECTOR,
        name: "erc20 approve",
        description: "approve an ERC-20 spender",
    },
];

/// Looks up a catalog action by selector.
pub fn catalog_action(selector: FixedBytes<4>) -> Option<&'static CatalogAction> {
    ACTION_CATALOG.iter().find(|a| a.selector == selector)
}

/// Raw per-token limit input, amounts as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimitRequest {
    /// Token contract address, hex string.
    pub token: String,
    /// Token decimals used to scale the amounts.
    pub decimals: u8,
    /// Per-transaction limit, decimal string in whole tokens.
    pub tx_limit: String,
    /// Per-day limit, decimal string in whole tokens.
    pub daily_limit: String,
}

/// Raw client input for a call policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPolicyRequest {
    /// Whether the delegated key may send ETH.
    pub allow_eth_transfer: bool,
    /// Allowed ETH recipients, hex strings.
    pub eth_recipients: Vec<String>,
    /// Global per-transaction ETH cap, decimal string in ether.
    pub eth_tx_cap: Option<String>,
    /// Global per-day ETH cap, decimal string in ether.
    pub eth_daily_cap: Option<String>,
    /// Whether the delegated key may transfer ERC-20 tokens.
    pub allow_erc20_transfer: bool,
    /// Token limits.
    pub tokens: Vec<TokenLimitRequest>,
    /// Extra catalog selectors to allow on specific targets, as
    /// (target hex, selector hex) pairs.
    pub extra_actions: Vec<(String, String)>,
}

/// Parses and lower-cases a 20-byte hex address.
pub fn parse_address(input: &str) -> Result<Address, EngineError> {
    let lowered = input.trim().to_ascii_lowercase();
    let hex = lowered
        .strip_prefix("0x")
        .ok_or_else(|| EngineError::Validation(format!("address missing 0x prefix: {input}")))?;
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Validation(format!("malformed address: {input}")));
    }
    lowered
        .parse()
        .map_err(|_| EngineError::Validation(format!("malformed address: {input}")))
}

/// Parses a 4-byte hex selector.
pub fn parse_selector(input: &str) -> Result<FixedBytes<4>, EngineError> {
    let hex = input.trim().strip_prefix("0x").unwrap_or(input.trim());
    if hex.len() != 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(EngineError::Validation(format!("malformed selector: {input}")));
    }
    let mut bytes = [0u8; 4];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = core::str::from_utf8(chunk)
            .map_err(|_| EngineError::Validation(format!("malformed selector: {input}")))?;
        bytes[i] = u8::from_str_radix(s, 16)
            .map_err(|_| EngineError::Validation(format!("malformed selector: {input}")))?;
    }
    Ok(FixedBytes(bytes))
}

/// Converts a decimal amount string into smallest units at the given scale.
/// Integer arithmetic only; rejects malformed input and excess precision.
pub fn parse_units(amount: &str, decimals: u8) -> Result<U256, EngineError> {
    let amount = amount.trim();
    if amount.is_empty() {
        return Err(EngineError::Validation("empty amount".to_string()));
    }
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
        || (int_part.is_empty() && frac_part.is_empty())
    {
        return Err(EngineError::Validation(format!("malformed amount: {amount}")));
    }
    if frac_part.len() > decimals as usize {
        return Err(EngineError::Validation(format!(
            "amount {amount} has more than {decimals} decimal places"
        )));
    }

    let scale = U256::from(10u8)
        .checked_pow(U256::from(decimals))
        .ok_or_else(|| EngineError::Validation(format!("unsupported decimals: {decimals}")))?;
    let int_value = if int_part.is_empty() {
        U256::ZERO
    } else {
        U256::from_str_radix(int_part, 10)
            .map_err(|_| EngineError::Validation(format!("amount too large: {amount}")))?
    };
    let frac_value = if frac_part.is_empty() {
        U256::ZERO
    } else {
        let parsed = U256::from_str_radix(frac_part, 10)
            .map_err(|_| EngineError::Validation(format!("malformed amount: {amount}")))?;
        let frac_scale = U256::from(10u8)
            .checked_pow(U256::from(decimals as usize - frac_part.len()))
            .ok_or_else(|| {
                EngineError::Validation(format!("unsupported decimals: {decimals}"))
            })?;
        parsed
            .checked_mul(frac_scale)
            .ok_or_else(|| EngineError::Validation(format!("amount overflow: {amount}")))?
    };
    int_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| EngineError::Validation(format!("amount overflow: {amount}")))
}

/// Normalizes a raw request into validated [`CallPolicySettings`].
pub fn normalize_call_policy(request: &CallPolicyRequest) -> Result<CallPolicySettings, EngineError> {
    let mut permissions = Vec::new();
    let mut recipients = Vec::new();

    if request.allow_eth_transfer {
        if request.eth_recipients.is_empty() {
            return Err(EngineError::Validation(
                "ETH transfer enabled but no recipient configured".to_string(),
            ));
        }
        for recipient in &request.eth_recipients {
            let address = parse_address(recipient)?;
            if !recipients.contains(&address) {
                recipients.push(address);
                permissions.push(Permission {
                    call_type: CallType::Single,
                    target: address,
                    selector: NATIVE_TRANSFER_SELECTOR,
                    rules: Vec::new(),
                });
            }
        }
    }

    // BTreeMap keyed by token de-duplicates while keeping deterministic order.
    let mut token_limits: BTreeMap<Address, TokenLimit> = BTreeMap::new();
    if request.allow_erc20_transfer {
        if request.tokens.is_empty() {
            return Err(EngineError::Validation(
                "ERC-20 transfer enabled but no token configured".to_string(),
            ));
        }
        for token in &request.tokens {
            let address = parse_address(&token.token)?;
            let tx_limit = parse_units(&token.tx_limit, token.decimals)?;
            let daily_limit = parse_units(&token.daily_limit, token.decimals)?;
            if daily_limit < tx_limit {
                return Err(EngineError::Validation(format!(
                    "token {address}: daily limit {daily_limit} below per-tx limit {tx_limit}"
                )));
            }
            let previous = token_limits.insert(
                address,
                TokenLimit { token: address, tx_limit, daily_limit, enabled: true },
            );
            if previous.is_none() {
                permissions.push(Permission {
                    call_type: CallType::Single,
                    target: address,
                    selector: ERC20_TRANSFER_SELECTOR,
                    rules: Vec::new(),
                });
            }
        }
    }

    for (target, selector) in &request.extra_actions {
        let target = parse_address(target)?;
        let selector = parse_selector(selector)?;
        permissions.push(Permission {
            call_type: CallType::Single,
            target,
            selector,
            rules: Vec::new(),
        });
    }

    let eth_tx_cap = request.eth_tx_cap.as_deref().map(|v| parse_units(v, 18)).transpose()?;
    let eth_daily_cap =
        request.eth_daily_cap.as_deref().map(|v| parse_units(v, 18)).transpose()?;
    if let (Some(tx), Some(daily)) = (eth_tx_cap, eth_daily_cap) {
        if daily < tx {
            return Err(EngineError::Validation(format!(
                "ETH daily cap {daily} below per-tx cap {tx}"
            )));
        }
    }

    Ok(CallPolicySettings {
        permissions,
        token_limits: token_limits.into_values().collect(),
        allowed_recipients: recipients,
        eth_tx_cap,
        eth_daily_cap,
    })
}

sol! {
    #[derive(Debug, Default, PartialEq, Eq)]
    struct SolParamRule {
        uint8 condition;
        uint64 offset;
        bytes32[] params;
    }

    #[derive(Debug, Default, PartialEq, Eq)]
    struct SolPermission {
        uint8 callType;
        address target;
        bytes4 selector;
        SolParamRule[] rules;
    }
}

/// ABI-encodes the permission list as the call-policy contract's init data.
pub fn encode_call_policy_init_data(settings: &CallPolicySettings) -> Bytes {
    let permissions: Vec<SolPermission> = settings
        .permissions
        .iter()
        .map(|p| SolPermission {
            callType: p.call_type.as_byte(),
            target: p.target,
            selector: p.selector,
            rules: p
                .rules
                .iter()
                .map(|r| SolParamRule {
                    condition: r.condition.as_byte(),
                    offset: r.offset,
                    params: r.params.clone(),
                })
                .collect(),
        })
        .collect();
    permissions.abi_encode().into()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn token_request(tx_limit: &str, daily_limit: &str) -> CallPolicyRequest {
        CallPolicyRequest {
            allow_erc20_transfer: true,
            tokens: vec![TokenLimitRequest {
                token: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
                decimals: 6,
                tx_limit: tx_limit.to_string(),
                daily_limit: daily_limit.to_string(),
            }],
            ..Default::default()
        }
    }

    #[rstest]
    #[case("1", 18, "1000000000000000000")]
    #[case("0.5", 18, "500000000000000000")]
    #[case("100", 6, "100000000")]
    #[case("0.000001", 6, "1")]
    #[case(".25", 2, "25")]
    fn parse_units_scales(#[case] input: &str, #[case] decimals: u8, #[case] expected: &str) {
        assert_eq!(
            parse_units(input, decimals).unwrap(),
            U256::from_str_radix(expected, 10).unwrap()
        );
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("1.2.3")]
    #[case("12a")]
    #[case("1e18")]
    #[case("-5")]
    fn parse_units_rejects_malformed(#[case] input: &str) {
        assert!(parse_units(input, 18).is_err());
    }

    #[test]
    fn parse_units_rejects_excess_precision() {
        assert!(parse_units("0.1234567", 6).is_err());
    }

    #[test]
    fn parse_units_rejects_oversized_decimals() {
        // 10^78 exceeds U256; the scale must error, never wrap.
        assert!(parse_units("1", 100).is_err());
        assert!(parse_units("1", u8::MAX).is_err());
        // The largest representable scale still parses.
        assert!(parse_units("1", 77).is_ok());
    }

    #[test]
    fn rejects_daily_limit_below_tx_limit() {
        let err = normalize_call_policy(&token_request("100", "50")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "got {err:?}");
    }

    #[test]
    fn accepts_equal_limits_and_scales_amounts() {
        let settings = normalize_call_policy(&token_request("100", "100")).unwrap();
        let limit = &settings.token_limits[0];
        assert_eq!(limit.tx_limit, U256::from(100_000_000u64));
        assert_eq!(limit.daily_limit, U256::from(100_000_000u64));
        assert!(limit.enabled);
        // Address was lower-cased during normalization.
        assert_eq!(
            limit.token.to_string().to_ascii_lowercase(),
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        );
        assert_eq!(settings.permissions[0].selector, ERC20_TRANSFER_SELECTOR);
    }

    #[test]
    fn eth_transfer_requires_recipients() {
        let request = CallPolicyRequest { allow_eth_transfer: true, ..Default::default() };
        assert!(normalize_call_policy(&request).is_err());
    }

    #[test]
    fn erc20_transfer_requires_tokens() {
        let request = CallPolicyRequest { allow_erc20_transfer: true, ..Default::default() };
        assert!(normalize_call_policy(&request).is_err());
    }

    #[test]
    fn recipients_and_tokens_are_deduplicated() {
        let mut request = token_request("10", "20");
        request.tokens.push(request.tokens[0].clone());
        request.allow_eth_transfer = true;
        request.eth_recipients = vec![
            "0x1111111111111111111111111111111111111111".to_string(),
            "0x1111111111111111111111111111111111111111".to_string(),
        ];
        let settings = normalize_call_policy(&request).unwrap();
        assert_eq!(settings.allowed_recipients.len(), 1);
        assert_eq!(settings.token_limits.len(), 1);
        // One native-transfer permission plus one ERC-20 permission; the
        // duplicate entries add nothing to the init data.
        assert_eq!(settings.permissions.len(), 2);
    }

    #[rstest]
    #[case("0x1111111111111111111111111111111111111111", true)]
    #[case("1111111111111111111111111111111111111111", false)]
    #[case("0x11111111111111111111111111111111111111", false)]
    #[case("0x11111111111111111111111111111111111111zz", false)]
    fn address_validation(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(parse_address(input).is_ok(), ok);
    }

    #[test]
    fn catalog_knows_transfer_selectors() {
        assert_eq!(catalog_action(NATIVE_TRANSFER_SELECTOR).unwrap().name, "native transfer");
        assert_eq!(catalog_action(ERC20_TRANSFER_SELECTOR).unwrap().name, "erc20 transfer");
        assert!(catalog_action(FixedBytes([0xde, 0xad, 0xbe, 0xef])).is_none());
    }

    #[test]
    fn init_data_round_trips() {
        let settings = normalize_call_policy(&token_request("1", "2")).unwrap();
        let encoded = encode_call_policy_init_data(&settings);
        let decoded = Vec::<SolPermission>::abi_decode(&encoded, true).unwrap();
        assert_eq!(decoded.len(), settings.permissions.len());
        assert_eq!(decoded[0].selector, ERC20_TRANSFER_SELECTOR);
    }
}
