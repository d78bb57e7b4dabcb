//! Validation engine for capital call data
//!
//! Rules run before the review summary is shown and again before the
//! document is created. Blocking findings stop the workflow; warnings are
//! shown to the user alongside the summary.

use crate::config::AllocationPolicy;
use crate::models::{CapitalCallData, Investor, AMOUNT_EPSILON};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.findings.iter().all(|f| f.severity == Severity::Warning)
    }

    pub fn blocking(&self) -> Vec<&str> {
        self.messages(Severity::Blocking)
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.messages(Severity::Warning)
    }

    fn messages(&self, severity: Severity) -> Vec<&str> {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .map(|f| f.message.as_str())
            .collect()
    }
}

/// What rules look at
pub struct ValidationContext<'a> {
    pub data: &'a CapitalCallData,
    pub investors: &'a [Investor],
}

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Problems found, as (severity, message)
    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)>;
}

pub struct ValidationEngine {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn ValidationRule>) {
        self.rules.push(rule);
    }

    pub fn validate(&self, ctx: &ValidationContext<'_>) -> ValidationReport {
        let findings: Vec<Finding> = self
            .rules
            .iter()
            .flat_map(|rule| {
                rule.check(ctx)
                    .into_iter()
                    .map(move |(severity, message)| Finding {
                        rule: rule.name().to_string(),
                        severity,
                        message,
                    })
            })
            .collect();

        let report = ValidationReport { findings };
        info!(
            rule_count = self.rules.len(),
            blocking = report.blocking().len(),
            warnings = report.warnings().len(),
            "Validation completed"
        );
        report
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Rules =================
//

pub struct RequiredFieldsRule;

impl ValidationRule for RequiredFieldsRule {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)> {
        let missing = ctx.data.missing_fields();
        if missing.is_empty() {
            return Vec::new();
        }
        vec![(
            Severity::Blocking,
            format!("Missing required fields: {}", missing.join(", ")),
        )]
    }
}

pub struct PositiveAmountRule;

impl ValidationRule for PositiveAmountRule {
    fn name(&self) -> &'static str {
        "positive_amount"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)> {
        let mut problems = Vec::new();
        if let Some(amount) = ctx.data.amount {
            if amount <= 0.0 {
                problems.push((Severity::Blocking, "The call amount must be positive".to_string()));
            }
        }
        for account in &ctx.data.gl_accounts {
            if account.allocated_amount.map(|a| a < 0.0).unwrap_or(false) {
                problems.push((
                    Severity::Blocking,
                    format!("Allocation to account {} is negative", account.code),
                ));
            }
        }
        problems
    }
}

/// Posting may not precede submission.
pub struct DateOrderRule;

impl ValidationRule for DateOrderRule {
    fn name(&self) -> &'static str {
        "date_order"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)> {
        match (ctx.data.submit_date, ctx.data.posting_date) {
            (Some(submit), Some(posting)) if posting < submit => vec![(
                Severity::Blocking,
                format!(
                    "Posting date {} is before the submit date {}",
                    posting, submit
                ),
            )],
            _ => Vec::new(),
        }
    }
}

pub struct AllocationRule {
    pub policy: AllocationPolicy,
}

impl ValidationRule for AllocationRule {
    fn name(&self) -> &'static str {
        "allocation_total"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)> {
        let (Some(amount), false) = (ctx.data.amount, ctx.data.gl_accounts.is_empty()) else {
            return Vec::new();
        };
        let total = ctx.data.total_allocated();
        let diff = total - amount;
        if diff.abs() < AMOUNT_EPSILON {
            return Vec::new();
        }

        let message = if diff > 0.0 {
            format!(
                "Allocations total {} which exceeds the call amount {}",
                format_amount(total),
                format_amount(amount)
            )
        } else {
            format!(
                "Allocations total {} which is {} short of the call amount {}",
                format_amount(total),
                format_amount(-diff),
                format_amount(amount)
            )
        };

        let severity = match self.policy {
            AllocationPolicy::Exact => Severity::Blocking,
            AllocationPolicy::NotExceed if diff > 0.0 => Severity::Blocking,
            AllocationPolicy::NotExceed | AllocationPolicy::FlagOnly => Severity::Warning,
        };
        vec![(severity, message)]
    }
}

/// Flags calls larger than what investors still owe, and over-called investors.
pub struct CommitmentHeadroomRule;

impl ValidationRule for CommitmentHeadroomRule {
    fn name(&self) -> &'static str {
        "commitment_headroom"
    }

    fn check(&self, ctx: &ValidationContext<'_>) -> Vec<(Severity, String)> {
        if ctx.investors.is_empty() {
            return Vec::new();
        }
        let mut problems: Vec<(Severity, String)> = ctx
            .investors
            .iter()
            .filter(|i| i.is_over_called())
            .map(|i| {
                (
                    Severity::Warning,
                    format!(
                        "Investor {} is already over-called by {}",
                        i.name,
                        format_amount(-i.remaining_commitment())
                    ),
                )
            })
            .collect();

        let remaining: f64 = ctx.investors.iter().map(Investor::remaining_commitment).sum();
        if let Some(amount) = ctx.data.amount {
            if amount > remaining + AMOUNT_EPSILON {
                problems.push((
                    Severity::Warning,
                    format!(
                        "Call amount {} exceeds the remaining commitment {}",
                        format_amount(amount),
                        format_amount(remaining)
                    ),
                ));
            }
        }
        problems
    }
}

/// Engine with the standard rule set.
pub fn create_default_validation_engine(policy: AllocationPolicy) -> ValidationEngine {
    let mut engine = ValidationEngine::new();
    engine.add_rule(Box::new(RequiredFieldsRule));
    engine.add_rule(Box::new(PositiveAmountRule));
    engine.add_rule(Box::new(DateOrderRule));
    engine.add_rule(Box::new(AllocationRule { policy }));
    engine.add_rule(Box::new(CommitmentHeadroomRule));
    engine
}

/// "1234567.5" -> "1,234,567.50"
pub fn format_amount(value: f64) -> String {
    let negative = value < 0.0;
    let cents = (value.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}{}.{:02}", if negative { "-" } else { "" }, grouped, fraction)
}

//
// ================= Tests =================
//
