use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use core_types::EngineError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InformationLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStyle {
    /// Can resolve at any moment once the outcome is known.
    Anytime,
    /// Resolves only at the end of a fixed period.
    EndOfPeriod,
}

/// Market archetype: information availability × resolution style.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Archetype {
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
}

impl Archetype {
    pub const ALL: [Archetype; 6] = [
        Archetype::A1,
        Archetype::A2,
        Archetype::A3,
        Archetype::A4,
        Archetype::A5,
        Archetype::A6,
    ];

    pub fn from_parts(info: InformationLevel, resolution: ResolutionStyle) -> Self {
        match (info, resolution) {
            (InformationLevel::Low, ResolutionStyle::Anytime) => Self::A1,
            (InformationLevel::Low, ResolutionStyle::EndOfPeriod) => Self::A2,
            (InformationLevel::Medium, ResolutionStyle::Anytime) => Self::A3,
            (InformationLevel::Medium, ResolutionStyle::EndOfPeriod) => Self::A4,
            (InformationLevel::High, ResolutionStyle::Anytime) => Self::A5,
            (InformationLevel::High, ResolutionStyle::EndOfPeriod) => Self::A6,
        }
    }

    pub fn information(self) -> InformationLevel {
        match self {
            Self::A1 | Self::A2 => InformationLevel::Low,
            Self::A3 | Self::A4 => InformationLevel::Medium,
            Self::A5 | Self::A6 => InformationLevel::High,
        }
    }

    pub fn resolution(self) -> ResolutionStyle {
        match self {
            Self::A1 | Self::A3 | Self::A5 => ResolutionStyle::Anytime,
            Self::A2 | Self::A4 | Self::A6 => ResolutionStyle::EndOfPeriod,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::A1 => "a1",
            Self::A2 => "a2",
            Self::A3 => "a3",
            Self::A4 => "a4",
            Self::A5 => "a5",
            Self::A6 => "a6",
        }
    }

    /// Built-in profile; lower-information archetypes get the wider lambda band.
    pub fn default_profile(self) -> MarchetypeProfile {
        let (beta_p, alpha_u, u_ref, lambda_min, lambda_max) = match self {
            Self::A1 => (0.5, 0.8, 100.0, 1.0, 2.5),
            Self::A2 => (0.6, 0.7, 80.0, 0.9, 2.0),
            Self::A3 => (0.7, 0.6, 60.0, 0.9, 2.0),
            Self::A4 => (0.8, 0.5, 50.0, 0.8, 1.6),
            Self::A5 => (0.9, 0.4, 40.0, 0.8, 1.5),
            Self::A6 => (1.0, 0.3, 30.0, 0.7, 1.3),
        };
        MarchetypeProfile {
            beta_p,
            alpha_u,
            u_ref,
            lambda_min,
            lambda_max,
        }
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Archetype {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a1" => Ok(Self::A1),
            "a2" => Ok(Self::A2),
            "a3" => Ok(Self::A3),
            "a4" => Ok(Self::A4),
            "a5" => Ok(Self::A5),
            "a6" => Ok(Self::A6),
            other => Err(EngineError::Config(format!("unknown archetype {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MarchetypeProfile {
    pub beta_p: f64,
    pub alpha_u: f64,
    pub u_ref: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
}

impl MarchetypeProfile {
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("beta_p", self.beta_p),
            ("alpha_u", self.alpha_u),
            ("u_ref", self.u_ref),
            ("lambda_min", self.lambda_min),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(EngineError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if !self.lambda_max.is_finite() || self.lambda_max < self.lambda_min {
            return Err(EngineError::Config(format!(
                "lambda_max {} must be at least lambda_min {}",
                self.lambda_max, self.lambda_min
            )));
        }
        Ok(())
    }
}

/// Validated profile per archetype. Construction is the only place profiles
/// are checked; lookups afterwards cannot fail.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchetypeTable {
    profiles: BTreeMap<Archetype, MarchetypeProfile>,
}

impl Default for ArchetypeTable {
    fn default() -> Self {
        Self {
            profiles: Archetype::ALL
                .into_iter()
                .map(|a| (a, a.default_profile()))
                .collect(),
        }
    }
}

impl ArchetypeTable {
    /// Built-in table with `overrides` laid over it.
    pub fn with_overrides(
        overrides: impl IntoIterator<Item = (Archetype, MarchetypeProfile)>,
    ) -> Result<Self, EngineError> {
        let mut table = Self::default();
        for (archetype, profile) in overrides {
            profile
                .validate()
                .map_err(|e| EngineError::Config(format!("archetype {archetype}: {e}")))?;
            table.profiles.insert(archetype, profile);
        }
        Ok(table)
    }

    pub fn get(&self, archetype: Archetype) -> MarchetypeProfile {
        self.profiles
            .get(&archetype)
            .copied()
            .unwrap_or_else(|| archetype.default_profile())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Archetype, &MarchetypeProfile)> {
        self.profiles.iter().map(|(a, p)| (*a, p))
    }
}
