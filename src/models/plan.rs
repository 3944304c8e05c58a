use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_PLAN_CATALOG: &str = "starter=50,growth=200,pro=1000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    /// Credits granted on purchase, also the plan's monthly quota.
    pub credits: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: BTreeMap<String, i32>,
}

fn normalize_plan_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

impl PlanCatalog {
    /// Parses `id=credits` pairs separated by commas, e.g. `starter=50,pro=1000`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut plans = BTreeMap::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, credits) = entry
                .split_once('=')
                .ok_or_else(|| format!("plan entry `{entry}` is missing `=`"))?;
            let id = normalize_plan_id(id);
            if id.is_empty() {
                return Err(format!("plan entry `{entry}` has an empty id"));
            }
            let credits: i32 = credits
                .trim()
                .parse()
                .map_err(|_| format!("plan `{id}` has a non-numeric credit grant"))?;
            if credits <= 0 {
                return Err(format!("plan `{id}` must grant a positive number of credits"));
            }
            plans.insert(id, credits);
        }
        if plans.is_empty() {
            return Err("plan catalog is empty".to_string());
        }
        Ok(Self { plans })
    }

    pub fn lookup(&self, plan_id: &str) -> Option<Plan> {
        let id = normalize_plan_id(plan_id);
        self.plans
            .get(&id)
            .map(|credits| Plan { id, credits: *credits })
    }

    pub fn plans(&self) -> Vec<Plan> {
        self.plans
            .iter()
            .map(|(id, credits)| Plan {
                id: id.clone(),
                credits: *credits,
            })
            .collect()
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::parse(DEFAULT_PLAN_CATALOG).expect("default plan catalog is well formed")
    }
}
