//! Static registry of agent roles.

use crate::agent::PersonaLayer;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentRole {
    pub id: &'static str,
    pub title: &'static str,
    pub default_model: &'static str,
    pub focus: &'static str,
}

const ROLES: &[AgentRole] = &[
    AgentRole {
        id: "analyst",
        title: "Business Analyst",
        default_model: "sonnet",
        focus: "Clarify requirements and acceptance criteria.",
    },
    AgentRole {
        id: "planner",
        title: "Technical Planner",
        default_model: "sonnet",
        focus: "Break the story into ordered, verifiable tasks.",
    },
    AgentRole {
        id: "architect",
        title: "Architect",
        default_model: "opus",
        focus: "Decide structure, boundaries and trade-offs.",
    },
    AgentRole {
        id: "developer",
        title: "Developer",
        default_model: "sonnet",
        focus: "Implement the tasks with tests.",
    },
    AgentRole {
        id: "reviewer",
        title: "Code Reviewer",
        default_model: "sonnet",
        focus: "Review changes for correctness and clarity.",
    },
    AgentRole {
        id: "tester",
        title: "Test Engineer",
        default_model: "sonnet",
        focus: "Write and run tests that pin down behaviour.",
    },
    AgentRole {
        id: "security",
        title: "Security Engineer",
        default_model: "opus",
        focus: "Find and fix vulnerabilities.",
    },
    AgentRole {
        id: "maintainer",
        title: "Maintainer",
        default_model: "sonnet",
        focus: "Keep versions, changelog and dependencies in order.",
    },
    AgentRole {
        id: "tech-writer",
        title: "Technical Writer",
        default_model: "haiku",
        focus: "Write user-facing documentation.",
    },
];

/// Roles the router can assign. Read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgentRegistry;

impl AgentRegistry {
    pub fn builtin() -> Self {
        Self
    }

    pub fn roles(&self) -> &'static [AgentRole] {
        ROLES
    }

    pub fn get(&self, id: &str) -> Option<&'static AgentRole> {
        ROLES.iter().find(|r| r.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        ROLES.iter().map(|r| r.id).collect()
    }

    /// Base persona layer for a role; empty for unknown ids.
    pub fn base_persona(&self, id: &str) -> PersonaLayer {
        match self.get(id) {
            Some(role) => PersonaLayer {
                title: Some(role.title.to_string()),
                model: Some(role.default_model.to_string()),
                instructions: Some(role.focus.to_string()),
                ..Default::default()
            },
            None => PersonaLayer::default(),
        }
    }
}
