//! Test plans: the part/section/item tree a session actually runs, after
//! selection and ordering.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::{AssessmentSection, AssessmentTest, Identifier, SectionPart};

/// Identifies one node of a plan: `identifier:globalIndex:instanceNumber`.
///
/// The global index is the node's position in a pre-order walk of the plan;
/// the instance number counts repeated selections of the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestPlanNodeKey {
    pub identifier: Identifier,
    pub global_index: usize,
    pub instance_number: usize,
}

impl fmt::Display for TestPlanNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.identifier, self.global_index, self.instance_number
        )
    }
}

impl FromStr for TestPlanNodeKey {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidNodeKey {
            text: text.to_string(),
        };
        let mut parts = text.rsplitn(3, ':');
        let instance = parts.next().ok_or_else(invalid)?;
        let index = parts.next().ok_or_else(invalid)?;
        let identifier = parts.next().ok_or_else(invalid)?;
        Ok(TestPlanNodeKey {
            identifier: Identifier::parse(identifier).map_err(|_| invalid())?,
            global_index: index.parse().map_err(|_| invalid())?,
            instance_number: instance.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for TestPlanNodeKey {
    type Error = ParseError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<TestPlanNodeKey> for String {
    fn from(key: TestPlanNodeKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    TestPart,
    Section,
    ItemRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPlanNode {
    pub key: TestPlanNodeKey,
    pub kind: NodeKind,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// Index of the last node in this node's subtree.
    pub last_descendant: usize,
}

impl TestPlanNode {
    pub fn identifier(&self) -> &Identifier {
        &self.key.identifier
    }

    pub fn index(&self) -> usize {
        self.key.global_index
    }

    pub fn is_item(&self) -> bool {
        self.kind == NodeKind::ItemRef
    }

    /// Whether `other` lies in this node's subtree (including itself).
    pub fn covers(&self, other: &TestPlanNode) -> bool {
        other.index() >= self.index() && other.index() <= self.last_descendant
    }
}

/// Read-only ordered tree, stored flat in pre-order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    nodes: Vec<TestPlanNode>,
}

impl TestPlan {
    pub fn nodes(&self) -> &[TestPlanNode] {
        &self.nodes
    }

    pub fn node(&self, key: &TestPlanNodeKey) -> Option<&TestPlanNode> {
        self.nodes.get(key.global_index).filter(|n| &n.key == key)
    }

    pub fn at(&self, index: usize) -> Option<&TestPlanNode> {
        self.nodes.get(index)
    }

    pub fn parent(&self, node: &TestPlanNode) -> Option<&TestPlanNode> {
        node.parent.and_then(|p| self.nodes.get(p))
    }

    pub fn test_parts(&self) -> impl Iterator<Item = &TestPlanNode> {
        self.nodes.iter().filter(|n| n.kind == NodeKind::TestPart)
    }

    /// Items in the subtree of `node`, document order.
    pub fn items_within(&self, node: &TestPlanNode) -> Vec<&TestPlanNode> {
        self.nodes[node.index()..=node.last_descendant]
            .iter()
            .filter(|n| n.is_item())
            .collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &TestPlanNode> {
        self.nodes.iter().filter(|n| n.is_item())
    }

    /// All nodes selected for `identifier`, in instance order.
    pub fn nodes_for(&self, identifier: &str) -> Vec<&TestPlanNode> {
        self.nodes
            .iter()
            .filter(|n| n.identifier().as_str() == identifier)
            .collect()
    }

    /// Ancestors from the parent up to (and including) the test part.
    pub fn ancestors(&self, node: &TestPlanNode) -> Vec<&TestPlanNode> {
        let mut out = Vec::new();
        let mut cursor = self.parent(node);
        while let Some(n) = cursor {
            out.push(n);
            cursor = self.parent(n);
        }
        out
    }

    /// The test part a node belongs to.
    pub fn test_part_of<'p>(&'p self, node: &'p TestPlanNode) -> Option<&'p TestPlanNode> {
        if node.kind == NodeKind::TestPart {
            return Some(node);
        }
        self.ancestors(node)
            .into_iter()
            .find(|n| n.kind == NodeKind::TestPart)
    }

    /// Section ancestors of `node`, innermost first.
    pub fn enclosing_sections(&self, node: &TestPlanNode) -> Vec<&TestPlanNode> {
        self.ancestors(node)
            .into_iter()
            .filter(|n| n.kind == NodeKind::Section)
            .collect()
    }

    fn push(
        &mut self,
        identifier: &Identifier,
        kind: NodeKind,
        parent: Option<usize>,
        instances: &mut BTreeMap<Identifier, usize>,
    ) -> usize {
        let index = self.nodes.len();
        let instance = instances.entry(identifier.clone()).or_insert(0);
        *instance += 1;
        self.nodes.push(TestPlanNode {
            key: TestPlanNodeKey {
                identifier: identifier.clone(),
                global_index: index,
                instance_number: *instance,
            },
            kind,
            parent,
            children: Vec::new(),
            last_descendant: index,
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(index);
        }
        index
    }

    fn close(&mut self, index: usize) {
        let last = self.nodes.len() - 1;
        self.nodes[index].last_descendant = last;
    }
}

// ──────────────────────────────────────────────
// Planner
// ──────────────────────────────────────────────

/// Builds a [`TestPlan`] by applying each section's selection and ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestPlanner;

impl TestPlanner {
    pub fn plan(test: &AssessmentTest, rng: &mut StdRng) -> TestPlan {
        let mut plan = TestPlan::default();
        let mut instances = BTreeMap::new();
        for part in &test.test_parts {
            let index = plan.push(&part.identifier, NodeKind::TestPart, None, &mut instances);
            for section in &part.sections {
                plan_section(&mut plan, section, index, rng, &mut instances);
            }
            plan.close(index);
        }
        tracing::debug!(
            test = %test.identifier,
            nodes = plan.nodes.len(),
            "built test plan"
        );
        plan
    }
}

fn plan_section(
    plan: &mut TestPlan,
    section: &AssessmentSection,
    parent: usize,
    rng: &mut StdRng,
    instances: &mut BTreeMap<Identifier, usize>,
) {
    let index = plan.push(&section.identifier, NodeKind::Section, Some(parent), instances);
    for child in select_and_order(section, rng) {
        match child {
            SectionPart::Section(inner) => plan_section(plan, inner, index, rng, instances),
            SectionPart::ItemRef(item_ref) => {
                plan.push(&item_ref.identifier, NodeKind::ItemRef, Some(index), instances);
            }
        }
    }
    plan.close(index);
}

/// Chosen children of a section, in delivery order.
fn select_and_order<'a>(
    section: &'a AssessmentSection,
    rng: &mut StdRng,
) -> Vec<&'a SectionPart> {
    let children = &section.children;
    let mut chosen: Vec<&SectionPart> = match section.selection {
        None => children.iter().collect(),
        Some(selection) if selection.with_replacement => {
            let mut picks: Vec<usize> = (0..children.len())
                .filter(|i| children[*i].is_required())
                .collect();
            if !children.is_empty() {
                while picks.len() < selection.select {
                    picks.push(rng.gen_range(0..children.len()));
                }
            }
            picks.sort_unstable();
            picks.into_iter().map(|i| &children[i]).collect()
        }
        Some(selection) => {
            let mut picks: Vec<usize> = (0..children.len())
                .filter(|i| children[*i].is_required())
                .collect();
            let mut optional: Vec<usize> = (0..children.len())
                .filter(|i| !children[*i].is_required())
                .collect();
            optional.shuffle(rng);
            let wanted = selection.select.saturating_sub(picks.len());
            picks.extend(optional.into_iter().take(wanted));
            picks.sort_unstable();
            picks.into_iter().map(|i| &children[i]).collect()
        }
    };

    if section.ordering.is_some_and(|o| o.shuffle) {
        let movable: Vec<usize> = (0..chosen.len())
            .filter(|i| !chosen[*i].is_fixed())
            .collect();
        let mut shuffled: Vec<&SectionPart> = movable.iter().map(|i| chosen[*i]).collect();
        shuffled.shuffle(rng);
        for (slot, part) in movable.into_iter().zip(shuffled) {
            chosen[slot] = part;
        }
    }
    chosen
}
