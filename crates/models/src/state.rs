/// Priority class of a data item, set from the upload's tags or headers.
/// Planner groups items by class and never mixes classes within a bundle.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "priority_class")]
#[sqlx(rename_all = "snake_case")]
pub enum PriorityClass {
    Warp,
    Ao,
    Default,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 3] = [Self::Warp, Self::Ao, Self::Default];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warp => "warp",
            Self::Ao => "ao",
            Self::Default => "default",
        }
    }
}

impl std::str::FromStr for PriorityClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warp" => Ok(Self::Warp),
            "ao" => Ok(Self::Ao),
            "default" => Ok(Self::Default),
            other => Err(format!("unknown priority class {other:?}")),
        }
    }
}

impl Default for PriorityClass {
    fn default() -> Self {
        Self::Default
    }
}

/// State of a bundle row. Transitions are monotonic
/// (new -> posted -> seeded -> permanent) except for the failure exits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "bundle_state")]
#[sqlx(rename_all = "snake_case")]
pub enum BundleState {
    New,
    Posted,
    Seeded,
    Permanent,
    Failed,
    Dropped,
}

/// Terminal reason recorded on a `failed_data_item` row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "failure_reason")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidSignature,
    MalformedItem,
    SizeMismatch,
    SizeExceeded,
    TooManyRetries,
    Quarantined,
}

/// Externally visible status of a data item, as served by `GET /v1/tx/:id/status`.
/// Derived from which state table currently owns the item, joined with its
/// bundle's progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    New,
    Planned,
    Posted,
    Seeded,
    Permanent,
    Failed,
    NotFound,
}
