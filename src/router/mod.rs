//! Task classification and strategy selection.
//!
//! [`CollaborationRouter::route`] classifies a task description with
//! [`classify`], picks the default agent set for its type, and resolves the
//! requested [`Strategy`]. `Strategy::Auto` never survives routing.

pub mod classify;
pub mod registry;

pub use classify::{Classification, Complexity, TaskType, classify};
pub use registry::{AgentRegistry, AgentRole};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the agents of a phase collaborate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Strategy {
    Sequential,
    Pair,
    Swarm { agents: Vec<String>, max_iterations: u32 },
    Auto,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Pair => "pair",
            Self::Swarm { .. } => "swarm",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swarm {
                agents,
                max_iterations,
            } => write!(
                f,
                "swarm [{}] (max {} rounds)",
                agents.join(", "),
                max_iterations
            ),
            other => write!(f, "{}", other.label()),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    /// Parses the strategy names accepted on the command line. Swarm agents
    /// are filled in by the router.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "pair" => Ok(Self::Pair),
            "swarm" => Ok(Self::Swarm {
                agents: Vec::new(),
                max_iterations: 0,
            }),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "Unknown strategy '{}'. Expected sequential, pair, swarm or auto",
                other
            )),
        }
    }
}

/// Result of routing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub strategy: Strategy,
    /// Agents taking part, lead agent first.
    pub agents: Vec<String>,
    pub classification: Classification,
}

impl RoutingDecision {
    /// Reviewer of a pair: the second agent, if any.
    pub fn reviewer(&self) -> Option<&str> {
        self.agents.get(1).map(String::as_str)
    }

    pub fn render(&self) -> String {
        let c = &self.classification;
        let mut out = format!(
            "Strategy:   {}\nAgents:     {}\nType:       {}\nComplexity: {}\n",
            self.strategy,
            self.agents.join(", "),
            c.task_type,
            c.complexity
        );
        if !c.matched_keywords.is_empty() {
            out.push_str(&format!("Keywords:   {}\n", c.matched_keywords.join(", ")));
        }
        out
    }
}

/// Picks strategy and agent set for a task.
#[derive(Debug, Clone)]
pub struct CollaborationRouter {
    registry: AgentRegistry,
    max_swarm_iterations: u32,
}

impl CollaborationRouter {
    pub fn new(registry: AgentRegistry, max_swarm_iterations: u32) -> Self {
        Self {
            registry,
            max_swarm_iterations: max_swarm_iterations.max(1),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Strategy the classification alone would pick.
    fn auto_strategy(classification: &Classification) -> Strategy {
        if classification.task_type == TaskType::Security {
            return Strategy::Swarm {
                agents: Vec::new(),
                max_iterations: 0,
            };
        }
        match classification.complexity {
            Complexity::Trivial | Complexity::Simple => Strategy::Sequential,
            Complexity::Moderate => Strategy::Pair,
            Complexity::Complex | Complexity::Critical => Strategy::Swarm {
                agents: Vec::new(),
                max_iterations: 0,
            },
        }
    }

    /// Classify `task` and resolve `requested` into a concrete strategy.
    pub fn route(&self, task: &str, requested: Strategy) -> RoutingDecision {
        let classification = classify(task);
        let mut agents: Vec<String> = classification
            .task_type
            .default_agents()
            .into_iter()
            .filter(|id| self.registry.contains(id))
            .collect();

        let strategy = match requested {
            Strategy::Auto => Self::auto_strategy(&classification),
            other => other,
        };

        let strategy = match strategy {
            Strategy::Sequential => {
                agents.truncate(1);
                Strategy::Sequential
            }
            Strategy::Pair => {
                if agents.len() < 2 {
                    agents.push("reviewer".to_string());
                }
                agents.truncate(2);
                Strategy::Pair
            }
            Strategy::Swarm {
                agents: requested_agents,
                max_iterations,
            } => {
                if !requested_agents.is_empty() {
                    agents = requested_agents;
                }
                if agents.len() < 2 {
                    let filler = if agents.iter().any(|a| a == "reviewer") {
                        "developer"
                    } else {
                        "reviewer"
                    };
                    agents.push(filler.to_string());
                }
                let max_iterations = if max_iterations == 0 {
                    self.max_swarm_iterations
                } else {
                    max_iterations
                };
                Strategy::Swarm {
                    agents: agents.clone(),
                    max_iterations,
                }
            }
            // Auto has been resolved above.
            Strategy::Auto => Strategy::Sequential,
        };

        RoutingDecision {
            strategy,
            agents,
            classification,
        }
    }
}

impl Default for CollaborationRouter {
    fn default() -> Self {
        Self::new(AgentRegistry::builtin(), 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> CollaborationRouter {
        CollaborationRouter::default()
    }

    // =========================================
    // Strategy parsing
    // =========================================

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Pair".parse::<Strategy>().unwrap(), Strategy::Pair);
        assert!(matches!("swarm".parse::<Strategy>().unwrap(), Strategy::Swarm { .. }));
        assert!("mob".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_is_tagged() {
        let swarm = Strategy::Swarm {
            agents: vec!["a".into(), "b".into()],
            max_iterations: 2,
        };
        let json = serde_json::to_string(&swarm).unwrap();
        assert!(json.contains("\"kind\":\"swarm\""));
        assert_eq!(serde_json::from_str::<Strategy>(&json).unwrap(), swarm);
    }

    // =========================================
    // Routing
    // =========================================

    #[test]
    fn test_security_routes_to_swarm_with_security_agents() {
        let decision = router().route("Fix the SQL injection in search", Strategy::Auto);
        assert_eq!(decision.classification.task_type, TaskType::Security);
        assert_eq!(
            decision.strategy,
            Strategy::Swarm {
                agents: vec!["security".into(), "architect".into(), "reviewer".into()],
                max_iterations: 3,
            }
        );
    }

    #[test]
    fn test_auto_by_complexity() {
        let r = router();
        assert_eq!(r.route("Fix typo in README", Strategy::Auto).strategy, Strategy::Sequential);
        assert_eq!(
            r.route("Add an API endpoint for invoices", Strategy::Auto).strategy,
            Strategy::Pair
        );
        assert!(matches!(
            r.route("Redesign the distributed job architecture", Strategy::Auto).strategy,
            Strategy::Swarm { .. }
        ));
    }

    #[test]
    fn test_resolved_strategy_is_never_auto() {
        let r = router();
        for task in [
            "",
            "tweak",
            "Fix crash on login",
            "Patch CVE in auth",
            "Migrate database schema",
            "Write tests for parser",
        ] {
            assert_ne!(r.route(task, Strategy::Auto).strategy, Strategy::Auto);
        }
    }

    #[test]
    fn test_pair_has_exactly_two_agents() {
        let decision = router().route("Refactor the billing module", Strategy::Pair);
        assert_eq!(decision.agents, vec!["architect", "developer"]);
        assert_eq!(decision.reviewer(), Some("developer"));
    }

    #[test]
    fn test_sequential_keeps_lead_agent_only() {
        let decision = router().route("Write docs for the CLI", Strategy::Sequential);
        assert_eq!(decision.agents, vec!["tech-writer"]);
    }

    #[test]
    fn test_explicit_swarm_agents_are_kept() {
        let decision = router().route(
            "Anything",
            Strategy::Swarm {
                agents: vec!["planner".into(), "analyst".into()],
                max_iterations: 5,
            },
        );
        assert_eq!(decision.agents, vec!["planner", "analyst"]);
        assert_eq!(
            decision.strategy,
            Strategy::Swarm {
                agents: vec!["planner".into(), "analyst".into()],
                max_iterations: 5,
            }
        );
    }

    #[test]
    fn test_route_is_deterministic() {
        let r = router();
        let task = "Optimize slow queries in the reporting API";
        assert_eq!(r.route(task, Strategy::Auto), r.route(task, Strategy::Auto));
    }

    #[test]
    fn test_render_lists_strategy_and_agents() {
        let text = router().route("Correct a typo in the README", Strategy::Auto).render();
        assert!(text.contains("Strategy:   sequential"));
        assert!(text.contains("tech-writer"));
    }
}
