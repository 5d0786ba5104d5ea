use tracing::debug;

use super::error::RevisionError;
use super::index::IndexTable;
use super::types::{
    BreakdownStep, CapStatus, IndexPoint, IndexRole, IndexSnapshot, Quarter, Regime,
    RevisionRequest, RevisionResult, StepValue, VarianceBasis, VariancePolicy,
};

/// Statutory cap on the annual index variance.
pub const CAP_RATE: f64 = 0.035;
pub const CAP_FACTOR: f64 = 1.035;

/// Inclusive `(first, last, regime)` brackets, tested in order. Anything outside is regime D.
pub const REGIME_BRACKETS: [(Quarter, Quarter, Regime); 3] = [
    (Quarter::at(2022, 2), Quarter::at(2023, 1), Regime::A),
    (Quarter::at(2023, 2), Quarter::at(2024, 1), Regime::B),
    (Quarter::at(2024, 2), Quarter::at(2026, 1), Regime::C),
];

#[derive(Debug, Clone, Copy)]
struct ResolvedIndices {
    reference: f64,
    revision: f64,
    n1: Option<f64>,
    n2: Option<f64>,
    n1_quarter: Quarter,
    n2_quarter: Quarter,
}

impl ResolvedIndices {
    fn n1(&self) -> Result<f64, RevisionError> {
        self.n1.ok_or(RevisionError::MissingIntermediateIndex {
            role: IndexRole::N1,
            quarter: self.n1_quarter,
        })
    }

    fn n2(&self) -> Result<f64, RevisionError> {
        self.n2.ok_or(RevisionError::MissingIntermediateIndex {
            role: IndexRole::N2,
            quarter: self.n2_quarter,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Variance {
    ratio: f64,
    basis: VarianceBasis,
}

impl Variance {
    fn none() -> Self {
        Self {
            ratio: 0.0,
            basis: VarianceBasis::None,
        }
    }

    fn of(numerator: f64, denominator: f64, basis: VarianceBasis) -> Self {
        Self {
            ratio: numerator / denominator - 1.0,
            basis,
        }
    }
}

#[derive(Debug, Clone)]
struct Term {
    label: &'static str,
    value: StepValue,
    multiplier: f64,
}

impl Term {
    fn ratio(label: &'static str, numerator: f64, denominator: f64) -> Self {
        let value = numerator / denominator;
        Self {
            label,
            value: StepValue::Ratio {
                numerator,
                denominator,
                value,
            },
            multiplier: value,
        }
    }

    fn factor(label: &'static str, value: f64) -> Self {
        Self {
            label,
            value: StepValue::Factor { value },
            multiplier: value,
        }
    }
}

struct Formula {
    text: &'static str,
    terms: Vec<Term>,
}

/// Parses `raw` and moves it `years_back` calendar years earlier.
///
/// Fails with `OffsetOutOfRange` when the target would fall before year 0.
pub fn offset(raw: &str, years_back: u16) -> Result<Quarter, RevisionError> {
    let quarter = raw.parse::<Quarter>()?;
    quarter
        .years_back(years_back)
        .ok_or(RevisionError::OffsetOutOfRange {
            quarter,
            years: years_back,
        })
}

pub fn classify_regime(quarter: Quarter) -> Regime {
    REGIME_BRACKETS
        .iter()
        .find(|(first, last, _)| *first <= quarter && quarter <= *last)
        .map(|(_, _, regime)| *regime)
        .unwrap_or(Regime::D)
}

pub fn cap_applies(variance_ratio: f64) -> bool {
    variance_ratio >= CAP_RATE
}

fn measure_variance(
    regime: Regime,
    policy: VariancePolicy,
    indices: &ResolvedIndices,
) -> Result<Variance, RevisionError> {
    match policy {
        VariancePolicy::Lenient => Ok(match (regime, indices.n1, indices.n2) {
            (Regime::C, Some(n1), Some(n2)) => Variance::of(n1, n2, VarianceBasis::N1OverN2),
            (_, Some(n1), _) => Variance::of(indices.revision, n1, VarianceBasis::RevisionOverN1),
            _ => Variance::none(),
        }),
        VariancePolicy::Strict => match regime {
            Regime::C => Ok(Variance::of(
                indices.n1()?,
                indices.n2()?,
                VarianceBasis::N1OverN2,
            )),
            Regime::A | Regime::B => Ok(Variance::of(
                indices.revision,
                indices.n1()?,
                VarianceBasis::RevisionOverN1,
            )),
            Regime::D => Ok(indices
                .n1
                .map(|n1| Variance::of(indices.revision, n1, VarianceBasis::RevisionOverN1))
                .unwrap_or_else(Variance::none)),
        },
    }
}

fn select_formula(
    regime: Regime,
    capped: bool,
    indices: &ResolvedIndices,
) -> Result<Formula, RevisionError> {
    let reference = indices.reference;
    let revision = indices.revision;
    let formula = match (regime, capped) {
        (Regime::D, _) | (Regime::A, false) => Formula {
            text: "L révisé = L actuel × ILC rev / ILC ref",
            terms: vec![Term::ratio("ILC rev / ILC ref", revision, reference)],
        },
        (Regime::A, true) => Formula {
            text: "L révisé = L actuel × ILC N-1 / ILC ref × 1,035",
            terms: vec![
                Term::ratio("ILC N-1 / ILC ref", indices.n1()?, reference),
                Term::factor("Plafond 1,035", CAP_FACTOR),
            ],
        },
        (Regime::B, true) => Formula {
            text: "L révisé = L actuel × ILC N-2 / ILC ref × (1 + 3,5 %)²",
            terms: vec![
                Term::ratio("ILC N-2 / ILC ref", indices.n2()?, reference),
                Term::factor("Plafond (1 + 3,5 %)²", CAP_FACTOR.powi(2)),
            ],
        },
        (Regime::B, false) => Formula {
            text: "L révisé = L actuel × ILC N-2 / ILC ref × 1,035 × ILC rev / ILC N-1",
            terms: vec![
                Term::ratio("ILC N-2 / ILC ref", indices.n2()?, reference),
                Term::factor("Plafond 1,035", CAP_FACTOR),
                Term::ratio("ILC rev / ILC N-1", revision, indices.n1()?),
            ],
        },
        (Regime::C, true) => Formula {
            text: "L révisé = L actuel × (1 + 3,5 %)² × ILC rev / ILC N-1",
            terms: vec![
                Term::factor("Plafond (1 + 3,5 %)²", CAP_FACTOR.powi(2)),
                Term::ratio("ILC rev / ILC N-1", revision, indices.n1()?),
            ],
        },
        (Regime::C, false) => Formula {
            text: "L révisé = L actuel × 1,035 × ILC rev / ILC N-2",
            terms: vec![
                Term::factor("Plafond 1,035", CAP_FACTOR),
                Term::ratio("ILC rev / ILC N-2", revision, indices.n2()?),
            ],
        },
    };
    Ok(formula)
}

/// Revised annual rent for `request`, with the regime, cap decision and an audit breakdown.
///
/// Fails when the table is empty, when the reference quarter would fall before year 0,
/// when the reference or revision index is absent, or when the selected branch needs
/// an N-1 / N-2 index the table lacks.
pub fn compute_revision(
    table: &IndexTable,
    request: &RevisionRequest,
) -> Result<RevisionResult, RevisionError> {
    if table.is_empty() {
        return Err(RevisionError::EmptyIndexSource);
    }
    request.validate()?;

    let revision_quarter = request.revision_quarter;
    let out_of_range = |years| RevisionError::OffsetOutOfRange {
        quarter: revision_quarter,
        years,
    };
    let reference_quarter = request.reference_quarter().ok_or(out_of_range(3))?;
    let n2_quarter = request.n2_quarter().ok_or(out_of_range(2))?;
    let n1_quarter = request.n1_quarter().ok_or(out_of_range(1))?;

    let reference = table
        .lookup(reference_quarter)
        .ok_or(RevisionError::MissingReferenceIndex {
            quarter: reference_quarter,
        })?;
    let revision = table
        .lookup(revision_quarter)
        .ok_or(RevisionError::MissingRevisionIndex {
            quarter: revision_quarter,
        })?;
    let indices = ResolvedIndices {
        reference,
        revision,
        n1: table.lookup(n1_quarter),
        n2: table.lookup(n2_quarter),
        n1_quarter,
        n2_quarter,
    };

    let regime = classify_regime(revision_quarter);
    let variance = measure_variance(regime, request.variance_policy, &indices)?;
    let cap_applied = cap_applies(variance.ratio);
    debug!(
        quarter = %revision_quarter,
        ?regime,
        variance = variance.ratio,
        basis = ?variance.basis,
        cap_applied,
        "classified revision"
    );

    let formula = select_formula(regime, cap_applied, &indices)?;
    let revised_rent = formula
        .terms
        .iter()
        .fold(request.current_rent, |rent, term| rent * term.multiplier);

    let mut breakdown = Vec::with_capacity(formula.terms.len() + 2);
    breakdown.push(BreakdownStep {
        label: "Loyer actuel".to_string(),
        value: StepValue::Amount {
            value: request.current_rent,
        },
    });
    breakdown.extend(formula.terms.into_iter().map(|term| BreakdownStep {
        label: term.label.to_string(),
        value: term.value,
    }));
    breakdown.push(BreakdownStep {
        label: "Loyer révisé".to_string(),
        value: StepValue::Amount {
            value: revised_rent,
        },
    });

    let cap_status = match (regime.is_cap_period(), cap_applied) {
        (false, _) => CapStatus::CommonLaw,
        (true, true) => CapStatus::Capped,
        (true, false) => CapStatus::UnderCap,
    };

    Ok(RevisionResult {
        revision_quarter,
        reference_quarter,
        regime,
        regime_label: regime.label(),
        variance_ratio: variance.ratio,
        variance_basis: variance.basis,
        cap_threshold: CAP_RATE,
        cap_applied,
        cap_status,
        current_rent: request.current_rent,
        revised_rent,
        formula: formula.text,
        indices: IndexSnapshot {
            reference: IndexPoint {
                quarter: reference_quarter,
                value: Some(reference),
            },
            n2: IndexPoint {
                quarter: n2_quarter,
                value: indices.n2,
            },
            n1: IndexPoint {
                quarter: n1_quarter,
                value: indices.n1,
            },
            revision: IndexPoint {
                quarter: revision_quarter,
                value: Some(revision),
            },
        },
        breakdown,
    })
}
