//! Converts alloy `DynSolValue` → factoryindex `DecodedValue`.

use alloy_dyn_abi::DynSolValue;
use factoryindex_core::types::DecodedValue;

/// Convert a decoded `DynSolValue` into a `DecodedValue`.
pub fn normalize(val: DynSolValue) -> DecodedValue {
    match val {
        DynSolValue::Bool(b) => DecodedValue::Bool(b),

        // Values that fit in 128 bits come back native, wider ones as decimal strings
        DynSolValue::Int(i, _bits) => match i128::try_from(i) {
            Ok(v) => DecodedValue::Int(v),
            Err(_) => DecodedValue::BigInt(i.to_string()),
        },

        DynSolValue::Uint(u, _bits) => match u128::try_from(u) {
            Ok(v) => DecodedValue::Uint(v),
            Err(_) => DecodedValue::BigUint(u.to_string()),
        },

        DynSolValue::FixedBytes(word, size) => DecodedValue::Bytes(word[..size].to_vec().into()),

        DynSolValue::Bytes(b) => DecodedValue::Bytes(b.into()),

        DynSolValue::String(s) => DecodedValue::Str(s),

        DynSolValue::Address(a) => DecodedValue::Address(a),

        DynSolValue::Array(vals) | DynSolValue::FixedArray(vals) => {
            DecodedValue::Array(vals.into_iter().map(normalize).collect())
        }

        DynSolValue::Tuple(fields) => {
            // Unnamed tuple fields get positional names "0", "1", ...
            let named = fields
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), normalize(v)))
                .collect();
            DecodedValue::Tuple(named)
        }

        DynSolValue::Function(f) => DecodedValue::Bytes(f.to_vec().into()),

        #[allow(unreachable_patterns)]
        other => DecodedValue::Bytes(other.abi_encode().into()),
    }
}
