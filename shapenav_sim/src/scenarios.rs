//! Named simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// NAV-001: clean drive along an L-shaped route
    Commute,

    /// NAV-002: heavy noise, multipath jumps and corrupt fixes
    UrbanCanyon,

    /// NAV-003: vehicle takes a side street and needs a new plan
    Detour,

    /// NAV-004: detour while the planner is down for several requests
    PlannerOutage,

    /// NAV-005: fixes arrive reordered and duplicated
    ShuffledDelivery,

    /// NAV-006: shape reloaded while a session is running on it
    HotReload,

    /// NAV-007: many concurrent sessions through the async runtime
    Fleet,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Commute,
            ScenarioId::UrbanCanyon,
            ScenarioId::Detour,
            ScenarioId::PlannerOutage,
            ScenarioId::ShuffledDelivery,
            ScenarioId::HotReload,
            ScenarioId::Fleet,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Commute => "commute",
            ScenarioId::UrbanCanyon => "urban_canyon",
            ScenarioId::Detour => "detour",
            ScenarioId::PlannerOutage => "planner_outage",
            ScenarioId::ShuffledDelivery => "shuffled_delivery",
            ScenarioId::HotReload => "hot_reload",
            ScenarioId::Fleet => "fleet",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Commute => "Clean 1 Hz fixes along an L-shaped route, expect completion without deviation",
            ScenarioId::UrbanCanyon => "12 m noise, 150 m multipath jumps and NaN fixes, expect no false deviation",
            ScenarioId::Detour => "Side street 150 m off route, expect one deviation, a re-plan and completion",
            ScenarioId::PlannerOutage => "Detour with the first 3 planner calls failing, expect spaced retries",
            ScenarioId::ShuffledDelivery => "20% reordered and 10% duplicated fixes, expect monotonic maneuvers",
            ScenarioId::HotReload => "Reload a shape mid-trip, old session keeps its version",
            ScenarioId::Fleet => "20 vehicles on 3 shapes through the async session runtime",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "commute" | "nav-001" => Ok(ScenarioId::Commute),
            "urban_canyon" | "urbancanyon" | "nav-002" => Ok(ScenarioId::UrbanCanyon),
            "detour" | "nav-003" => Ok(ScenarioId::Detour),
            "planner_outage" | "planneroutage" | "nav-004" => Ok(ScenarioId::PlannerOutage),
            "shuffled_delivery" | "shuffleddelivery" | "nav-005" => Ok(ScenarioId::ShuffledDelivery),
            "hot_reload" | "hotreload" | "nav-006" => Ok(ScenarioId::HotReload),
            "fleet" | "nav-007" => Ok(ScenarioId::Fleet),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("NAV-003".parse::<ScenarioId>(), Ok(ScenarioId::Detour));
        assert_eq!("PlannerOutage".parse::<ScenarioId>(), Ok(ScenarioId::PlannerOutage));
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
