//! Post-load data quality checks. Read-only; every check runs regardless of
//! how the others turned out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ValidationConfig;
use crate::constants;
use crate::error::Result;
use crate::pipeline::transform::features::FeatureConfig;
use crate::pipeline::{Stage, StageOutput};
use crate::types::{AqiCategory, CanonicalRecord, Pollutant, RiskLevel, StagedDataset};

pub const CHECK_REQUIRED_FIELDS: &str = "required_fields_present";
pub const CHECK_ROW_COUNT_VS_RAW: &str = "row_count_vs_raw";
pub const CHECK_SINK_ROW_COUNT: &str = "sink_row_count";
pub const CHECK_CATEGORICAL_DOMAINS: &str = "categorical_domains";
pub const CHECK_RISK_CONSISTENCY: &str = "risk_level_consistency";
pub const CHECK_CATEGORY_COVERAGE: &str = "category_coverage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    /// Worth a look, does not fail the run
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn pass(detail: impl Into<String>) -> Self {
        Self::new(CheckStatus::Pass, detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: BTreeMap<String, CheckResult>,
}

impl ValidationReport {
    /// No check failed; warnings are allowed
    pub fn passed(&self) -> bool {
        self.checks.values().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &CheckResult)> {
        self.checks.iter().filter(|(_, c)| c.status == CheckStatus::Fail)
    }
}

/// Everything the checks look at
#[derive(Debug, Clone)]
pub struct ValidationInput {
    /// Rows produced by flattening the raw snapshots
    pub raw_count: usize,
    pub staged: Arc<StagedDataset>,
    /// Rows this run added to the sink; `None` when the sink could not be counted
    pub sink_count: Option<usize>,
}

pub struct Validator {
    required_fields: Vec<String>,
    features: FeatureConfig,
}

impl Validator {
    pub fn new(config: &ValidationConfig, features: &FeatureConfig) -> Self {
        Self {
            required_fields: config.required_fields.clone(),
            features: features.clone(),
        }
    }

    pub fn validate(&self, raw_count: usize, staged: &StagedDataset, sink_count: Option<usize>) -> ValidationReport {
        let mut checks = BTreeMap::new();
        checks.insert(CHECK_REQUIRED_FIELDS.to_string(), self.check_required_fields(staged));
        checks.insert(CHECK_ROW_COUNT_VS_RAW.to_string(), check_row_count_vs_raw(raw_count, staged));
        checks.insert(CHECK_SINK_ROW_COUNT.to_string(), check_sink_row_count(staged, sink_count));
        checks.insert(CHECK_CATEGORICAL_DOMAINS.to_string(), check_categorical_domains(staged));
        checks.insert(CHECK_RISK_CONSISTENCY.to_string(), self.check_risk_consistency(staged));
        checks.insert(CHECK_CATEGORY_COVERAGE.to_string(), check_category_coverage(staged));

        for (name, check) in &checks {
            match check.status {
                CheckStatus::Pass => info!(check = %name, detail = %check.detail, "check passed"),
                CheckStatus::Warn => warn!(check = %name, detail = %check.detail, "check warning"),
                CheckStatus::Fail => warn!(check = %name, detail = %check.detail, "check failed"),
            }
        }
        ValidationReport { checks }
    }

    fn check_required_fields(&self, staged: &StagedDataset) -> CheckResult {
        let mut problems = Vec::new();
        for field in &self.required_fields {
            if !is_numeric_field(field) {
                problems.push(format!("{}: not a numeric field", field));
                continue;
            }
            let missing = staged
                .records
                .iter()
                .filter(|r| numeric_field(r, field).is_none())
                .count();
            if missing > 0 {
                problems.push(format!("{}: {} missing", field, missing));
            }
        }
        if problems.is_empty() {
            CheckResult::pass(format!("no missing values in {}", self.required_fields.join(", ")))
        } else {
            CheckResult::new(CheckStatus::Fail, problems.join("; "))
        }
    }

    fn check_risk_consistency(&self, staged: &StagedDataset) -> CheckResult {
        let ladder = self.features.risk_ladder();
        let inconsistent = staged
            .records
            .iter()
            .filter(|r| !RiskLevel::ALL.contains(&r.risk_level) || ladder.classify(r.severity_score) != r.risk_level)
            .count();
        if inconsistent == 0 {
            CheckResult::pass("every risk level matches its severity score")
        } else {
            CheckResult::new(
                CheckStatus::Fail,
                format!("{} rows have a risk level that disagrees with their score", inconsistent),
            )
        }
    }
}

fn is_numeric_field(field: &str) -> bool {
    Pollutant::ALL.iter().any(|p| p.column() == field)
        || [constants::COL_UV_INDEX, constants::COL_SEVERITY_SCORE, constants::COL_HOUR].contains(&field)
}

fn numeric_field(record: &CanonicalRecord, field: &str) -> Option<f64> {
    if let Some(p) = Pollutant::ALL.iter().find(|p| p.column() == field) {
        return record.measurements.get(*p);
    }
    match field {
        constants::COL_UV_INDEX => record.uv_index,
        constants::COL_SEVERITY_SCORE => record.severity_score,
        constants::COL_HOUR => record.hour.map(f64::from),
        _ => None,
    }
}

fn check_row_count_vs_raw(raw_count: usize, staged: &StagedDataset) -> CheckResult {
    let unique: HashSet<String> = staged
        .records
        .iter()
        .filter_map(|r| serde_json::to_string(r).ok())
        .collect();
    let detail = format!("raw rows: {}, unique staged rows: {}", raw_count, unique.len());
    if unique.len() == raw_count {
        CheckResult::pass(detail)
    } else {
        CheckResult::new(CheckStatus::Warn, detail)
    }
}

fn check_sink_row_count(staged: &StagedDataset, sink_count: Option<usize>) -> CheckResult {
    match sink_count {
        Some(n) if n == staged.len() => CheckResult::pass(format!("sink gained {} rows", n)),
        Some(n) => CheckResult::new(
            CheckStatus::Fail,
            format!("sink gained {} rows, staged {}", n, staged.len()),
        ),
        None => CheckResult::new(CheckStatus::Fail, "sink row count unknown"),
    }
}

fn check_categorical_domains(staged: &StagedDataset) -> CheckResult {
    let aqi: BTreeSet<AqiCategory> = staged.records.iter().map(|r| r.aqi_category).collect();
    let risk: BTreeSet<RiskLevel> = staged.records.iter().map(|r| r.risk_level).collect();
    let stray_aqi = aqi.iter().filter(|c| !AqiCategory::ALL.contains(c)).count();
    let stray_risk = risk.iter().filter(|c| !RiskLevel::ALL.contains(c)).count();

    let detail = format!(
        "aqi_category {{{}}}, risk_flag {{{}}}",
        aqi.iter().map(|c| c.label()).collect::<Vec<_>>().join(", "),
        risk.iter().map(|c| c.label()).collect::<Vec<_>>().join(", ")
    );
    if stray_aqi + stray_risk == 0 {
        CheckResult::pass(detail)
    } else {
        CheckResult::new(CheckStatus::Fail, detail)
    }
}

fn check_category_coverage(staged: &StagedDataset) -> CheckResult {
    let seen_aqi: BTreeSet<AqiCategory> = staged.records.iter().map(|r| r.aqi_category).collect();
    let seen_risk: BTreeSet<RiskLevel> = staged.records.iter().map(|r| r.risk_level).collect();

    let mut unseen: Vec<&str> = AqiCategory::ALL
        .iter()
        .filter(|c| **c != AqiCategory::Unknown && !seen_aqi.contains(c))
        .map(|c| c.label())
        .collect();
    unseen.extend(
        RiskLevel::ALL
            .iter()
            .filter(|c| **c != RiskLevel::Unknown && !seen_risk.contains(c))
            .map(|c| c.label()),
    );

    if unseen.is_empty() {
        CheckResult::pass("every category observed")
    } else {
        CheckResult::new(CheckStatus::Warn, format!("never observed: {}", unseen.join(", ")))
    }
}

#[async_trait]
impl Stage for Validator {
    type Input = ValidationInput;
    type Output = ValidationReport;

    fn name(&self) -> &'static str {
        "validate"
    }

    async fn run(&self, input: &ValidationInput, _cancel: &CancellationToken) -> Result<StageOutput<ValidationReport>> {
        let report = self.validate(input.raw_count, &input.staged, input.sink_count);
        let reasons = report
            .failures()
            .map(|(name, check)| format!("{}: {}", name, check.detail))
            .collect();
        Ok(StageOutput::degraded_if(report, reasons))
    }
}
