use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plan {
    Basic,
    Pro,
    Premium,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0:?}")]
pub struct UnknownPlan(pub String);

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Basic, Plan::Pro, Plan::Premium];

    /// Default credit pack granted when the plan is applied.
    pub const fn credit_pack(self) -> i64 {
        match self {
            Plan::Basic => 50,
            Plan::Pro => 200,
            Plan::Premium => 1000,
        }
    }

    pub const fn is_paid(self) -> bool {
        matches!(self, Plan::Pro | Plan::Premium)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Plan::Basic => "Basic",
            Plan::Pro => "Pro",
            Plan::Premium => "Premium",
        }
    }

    /// Parses a label case-insensitively. Surrounding whitespace is ignored.
    pub fn parse(label: &str) -> Result<Self, UnknownPlan> {
        let trimmed = label.trim();
        Plan::ALL
            .into_iter()
            .find(|plan| plan.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownPlan(trimmed.to_string()))
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
