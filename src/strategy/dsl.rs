//! The decision DSL the LLM Dispatcher's output (and program-supplied
//! strategies) are written in: `evaluate(context) -> [Decision]` (spec §9
//! REDESIGN FLAGS) realized as a restricted, line-oriented text format
//! rather than an in-process interpreter.
//!
//! Grounded on `vault/llm.rs::parse_decision_dsl`: blocks of `KEY=VALUE`
//! lines, strict rejection of unrecognized keys, generalized from a single
//! BUY/SELL/HOLD decision to a program emitting a list of decision blocks
//! separated by blank lines.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct RawDecision {
    pub symbol: String,
    pub raw_signal: String,
    pub quantity: f64,
    pub leverage: Option<u32>,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub justification: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DslError {
    UnknownKey(String),
    MissingField(String),
    InvalidValue { key: String, value: String },
}

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DslError::UnknownKey(k) => write!(f, "unknown key in decision dsl: {k}"),
            DslError::MissingField(k) => write!(f, "missing required field: {k}"),
            DslError::InvalidValue { key, value } => write!(f, "invalid value for {key}: {value}"),
        }
    }
}

/// Parses a full program into its decision blocks. A block is a run of
/// non-blank `KEY=VALUE` lines; blocks are separated by one or more blank
/// lines. An unrecognized key fails the whole program — the same strict
/// posture as `parse_decision_dsl` — since it signals the LLM drifted from
/// the contract, not a single bad decision among good ones.
pub fn parse_decision_program(text: &str) -> Result<Vec<RawDecision>, DslError> {
    let mut decisions = Vec::new();
    let mut block: Vec<(&str, &str)> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !block.is_empty() {
                decisions.push(parse_block(&block)?);
                block.clear();
            }
            continue;
        }
        let (key, value) = trimmed
            .split_once('=')
            .ok_or_else(|| DslError::InvalidValue {
                key: "line".to_string(),
                value: trimmed.to_string(),
            })?;
        block.push((key.trim(), value.trim()));
    }
    if !block.is_empty() {
        decisions.push(parse_block(&block)?);
    }
    Ok(decisions)
}

fn parse_block(lines: &[(&str, &str)]) -> Result<RawDecision, DslError> {
    let mut symbol = None;
    let mut signal = None;
    let mut quantity = None;
    let mut leverage = None;
    let mut price = None;
    let mut stop_price = None;
    let mut justification = None;

    for (key, value) in lines {
        match key.to_ascii_uppercase().as_str() {
            "SYMBOL" => symbol = Some(value.to_uppercase()),
            "SIGNAL" => signal = Some(value.to_lowercase()),
            "QUANTITY" => {
                quantity = Some(value.parse::<f64>().map_err(|_| DslError::InvalidValue {
                    key: "QUANTITY".to_string(),
                    value: value.to_string(),
                })?)
            }
            "LEVERAGE" => {
                leverage = Some(value.parse::<u32>().map_err(|_| DslError::InvalidValue {
                    key: "LEVERAGE".to_string(),
                    value: value.to_string(),
                })?)
            }
            "PRICE" => {
                price = Some(value.parse::<f64>().map_err(|_| DslError::InvalidValue {
                    key: "PRICE".to_string(),
                    value: value.to_string(),
                })?)
            }
            "STOP_PRICE" => {
                stop_price = Some(value.parse::<f64>().map_err(|_| DslError::InvalidValue {
                    key: "STOP_PRICE".to_string(),
                    value: value.to_string(),
                })?)
            }
            "JUSTIFICATION" => justification = Some(value.to_string()),
            other => return Err(DslError::UnknownKey(other.to_string())),
        }
    }

    Ok(RawDecision {
        symbol: symbol.ok_or_else(|| DslError::MissingField("SYMBOL".to_string()))?,
        raw_signal: signal.ok_or_else(|| DslError::MissingField("SIGNAL".to_string()))?,
        quantity: quantity.ok_or_else(|| DslError::MissingField("QUANTITY".to_string()))?,
        leverage,
        price,
        stop_price,
        justification,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_blocks_separated_by_blank_lines() {
        let program = "SYMBOL=BTCUSDT\nSIGNAL=buy_to_long\nQUANTITY=0.1\n\nSYMBOL=ETHUSDT\nSIGNAL=buy_to_short\nQUANTITY=1.0\nLEVERAGE=5\n";
        let decisions = parse_decision_program(program).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].symbol, "BTCUSDT");
        assert_eq!(decisions[1].leverage, Some(5));
    }

    #[test]
    fn unknown_key_fails_whole_program() {
        let program = "SYMBOL=BTCUSDT\nSIGNAL=buy_to_long\nQUANTITY=0.1\nFOO=bar\n";
        let err = parse_decision_program(program).unwrap_err();
        assert!(matches!(err, DslError::UnknownKey(k) if k == "FOO"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let program = "SYMBOL=BTCUSDT\nQUANTITY=0.1\n";
        let err = parse_decision_program(program).unwrap_err();
        assert!(matches!(err, DslError::MissingField(f) if f == "SIGNAL"));
    }

    #[test]
    fn malformed_quantity_is_a_parse_error() {
        let program = "SYMBOL=BTCUSDT\nSIGNAL=buy_to_long\nQUANTITY=not_a_number\n";
        let err = parse_decision_program(program).unwrap_err();
        assert!(matches!(err, DslError::InvalidValue { key, .. } if key == "QUANTITY"));
    }

    #[test]
    fn empty_program_parses_to_no_decisions() {
        assert_eq!(parse_decision_program("\n\n").unwrap(), vec![]);
    }
}
