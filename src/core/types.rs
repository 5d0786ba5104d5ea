use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::RevisionError;

/// A calendar quarter, written `YYYY-T{1..4}`.
///
/// Ordering is by `(year, quarter)`. Offsets never go below year 0, so every
/// quarter they produce prints back into the `YYYY-T{1..4}` form.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quarter {
    year: i32,
    quarter: u8,
}

impl Quarter {
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        (1..=4).contains(&quarter).then_some(Self { year, quarter })
    }

    pub(crate) const fn at(year: i32, quarter: u8) -> Self {
        assert!(quarter >= 1 && quarter <= 4);
        Self { year, quarter }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn quarter(self) -> u8 {
        self.quarter
    }

    /// `year + quarter / 10`, e.g. `2024-T2` is `2024.2`.
    pub fn year_float(self) -> f64 {
        f64::from(self.year) + f64::from(self.quarter) / 10.0
    }

    /// Same quarter number, `years` calendar years earlier. `None` below year 0.
    pub fn years_back(self, years: u16) -> Option<Self> {
        let year = self.year - i32::from(years);
        (year >= 0).then_some(Self {
            year,
            quarter: self.quarter,
        })
    }

    /// Quarter-precision offset. Crossing a Q1 boundary rolls into the previous year.
    pub fn shifted_back(self, years: u16, quarters: u32) -> Option<Self> {
        let absolute = i64::from(self.year) * 4 + i64::from(self.quarter - 1);
        let target = absolute - i64::from(years) * 4 - i64::from(quarters);
        if target < 0 {
            return None;
        }
        Some(Self {
            year: i32::try_from(target / 4).ok()?,
            quarter: (target % 4) as u8 + 1,
        })
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-T{}", self.year, self.quarter)
    }
}

impl FromStr for Quarter {
    type Err = RevisionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let malformed = || RevisionError::MalformedQuarter(raw.to_string());
        let (year, quarter) = raw.trim().split_once("-T").ok_or_else(malformed)?;
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let quarter = match quarter.as_bytes() {
            [digit @ b'1'..=b'4'] => digit - b'0',
            _ => return Err(malformed()),
        };
        let year = year.parse::<i32>().map_err(|_| malformed())?;
        Ok(Self { year, quarter })
    }
}

impl TryFrom<String> for Quarter {
    type Error = RevisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quarter> for String {
    fn from(value: Quarter) -> Self {
        value.to_string()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Regime {
    A,
    B,
    C,
    D,
}

impl Regime {
    pub fn label(self) -> &'static str {
        match self {
            Regime::A => "Période de Plafonnement Initial (Cas A).",
            Regime::B => "Période de Plafonnement Intermédiaire (Cas B).",
            Regime::C => "Période Post-Plafonnement (Cas C).",
            Regime::D => "Hors période de plafonnement. Application du droit commun.",
        }
    }

    pub fn is_cap_period(self) -> bool {
        !matches!(self, Regime::D)
    }
}

/// Intermediate index between the reference and revision quarters.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexRole {
    N2,
    N1,
}

impl IndexRole {
    pub fn label(self) -> &'static str {
        match self {
            IndexRole::N2 => "N-2",
            IndexRole::N1 => "N-1",
        }
    }
}

/// How the variance test treats absent N-1 / N-2 indices.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariancePolicy {
    /// Missing inputs of the regime's designated pair fail the computation.
    #[default]
    Strict,
    /// Fall back to the revision/N-1 pair, then to a zero variance.
    Lenient,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VarianceBasis {
    N1OverN2,
    RevisionOverN1,
    None,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapStatus {
    Capped,
    UnderCap,
    CommonLaw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevisionRequest {
    pub current_rent: f64,
    pub revision_quarter: Quarter,
    pub variance_policy: VariancePolicy,
}

impl RevisionRequest {
    pub fn parse(
        current_rent: f64,
        revision_quarter: &str,
        variance_policy: VariancePolicy,
    ) -> Result<Self, RevisionError> {
        let request = Self {
            current_rent,
            revision_quarter: revision_quarter.parse()?,
            variance_policy,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn validate(&self) -> Result<(), RevisionError> {
        if !self.current_rent.is_finite() || self.current_rent <= 0.0 {
            return Err(RevisionError::InvalidRent(self.current_rent));
        }
        Ok(())
    }

    pub fn reference_quarter(&self) -> Option<Quarter> {
        self.revision_quarter.years_back(3)
    }

    pub fn n1_quarter(&self) -> Option<Quarter> {
        self.revision_quarter.years_back(1)
    }

    pub fn n2_quarter(&self) -> Option<Quarter> {
        self.revision_quarter.years_back(2)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct IndexPoint {
    pub quarter: Quarter,
    pub value: Option<f64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSnapshot {
    pub reference: IndexPoint,
    pub n2: IndexPoint,
    pub n1: IndexPoint,
    pub revision: IndexPoint,
}

/// Numeric payload of a breakdown step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepValue {
    Amount {
        value: f64,
    },
    Ratio {
        numerator: f64,
        denominator: f64,
        value: f64,
    },
    Factor {
        value: f64,
    },
}

impl StepValue {
    pub fn value(&self) -> f64 {
        match self {
            StepValue::Amount { value }
            | StepValue::Ratio { value, .. }
            | StepValue::Factor { value } => *value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownStep {
    pub label: String,
    pub value: StepValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionResult {
    pub revision_quarter: Quarter,
    pub reference_quarter: Quarter,
    pub regime: Regime,
    pub regime_label: &'static str,
    pub variance_ratio: f64,
    pub variance_basis: VarianceBasis,
    pub cap_threshold: f64,
    pub cap_applied: bool,
    pub cap_status: CapStatus,
    pub current_rent: f64,
    pub revised_rent: f64,
    pub formula: &'static str,
    pub indices: IndexSnapshot,
    pub breakdown: Vec<BreakdownStep>,
}
