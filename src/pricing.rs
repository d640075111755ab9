use std::collections::HashMap;

use thiserror::Error;

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    features: HashMap<String, FeaturePricing>,
}

#[derive(Clone, Debug)]
pub struct FeaturePricing {
    pub usd_micros_per_unit: u64,
    pub usd_micros_per_call: u64,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for feature {feature}: expected object")]
    InvalidFeatureEntry { feature: String },
    #[error("invalid pricing entry for feature {feature}: missing both unit/call cost")]
    MissingCosts { feature: String },
    #[error("invalid pricing entry for feature {feature}: invalid cost value for {field}")]
    InvalidCostValue { feature: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PricingTable {
    pub fn from_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Self::from_json_value(&value)
    }

    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, PricingTableError> {
        let Some(root) = value.as_object() else {
            return Err(PricingTableError::InvalidRoot);
        };

        let mut features = HashMap::new();
        for (feature, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(PricingTableError::InvalidFeatureEntry {
                    feature: feature.clone(),
                });
            };

            let per_unit = parse_cost_usd(obj, "usd_per_unit")
                .map(|usd| usd_to_micros(usd, feature, "usd_per_unit"))
                .transpose()?;
            let per_call = parse_cost_usd(obj, "usd_per_call")
                .map(|usd| usd_to_micros(usd, feature, "usd_per_call"))
                .transpose()?;

            if per_unit.is_none() && per_call.is_none() {
                return Err(PricingTableError::MissingCosts {
                    feature: feature.clone(),
                });
            }

            features.insert(
                feature.clone(),
                FeaturePricing {
                    usd_micros_per_unit: per_unit.unwrap_or(0),
                    usd_micros_per_call: per_call.unwrap_or(0),
                },
            );
        }

        Ok(Self { features })
    }

    pub fn feature_pricing(&self, feature: &str) -> Option<&FeaturePricing> {
        self.features.get(feature)
    }

    /// Charge amount for one call consuming `quantity` units, or `None`
    /// when the feature carries no pricing.
    pub fn estimate_charge_usd_micros(&self, feature: &str, quantity: u64) -> Option<u64> {
        let pricing = self.feature_pricing(feature)?;
        let units = quantity.saturating_mul(pricing.usd_micros_per_unit);
        Some(units.saturating_add(pricing.usd_micros_per_call))
    }
}

fn parse_cost_usd(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &'static str,
) -> Option<f64> {
    obj.get(key).and_then(|value| value.as_f64())
}

fn usd_to_micros(usd: f64, feature: &str, field: &'static str) -> Result<u64, PricingTableError> {
    if !usd.is_finite() || usd < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            feature: feature.to_string(),
            field,
        });
    }
    let micros = (usd * 1_000_000.0).round();
    if !micros.is_finite() || micros < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            feature: feature.to_string(),
            field,
        });
    }
    Ok(if micros > u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    })
}
