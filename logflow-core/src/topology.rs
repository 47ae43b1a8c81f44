//! A [Topology] is the validated graph of computations (nodes) connected by streams (edges).
//! Every stream a computation touches must be declared with its partition count, and the graph
//! must be acyclic; [TopologyBuilder::build] reports every violation at once.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::computation::{Computation, ComputationMetadata, StreamMapping};

mod error;

pub use error::{TopologyError, TopologyProblem};

/// Creates a fresh computation instance, called once per task.
pub type ComputationSupplier = Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Identifier of the task running partition `partition` of `computation`.
pub fn task_id(computation: &str, partition: u16) -> String {
    format!("{computation}:{partition}")
}

pub(crate) struct ComputationNode {
    pub(crate) metadata: ComputationMetadata,
    pub(crate) mapping: Arc<StreamMapping>,
    pub(crate) supplier: ComputationSupplier,
}

#[derive(Default)]
pub struct TopologyBuilder {
    computations: Vec<(ComputationSupplier, Vec<String>)>,
    streams: BTreeMap<String, u16>,
}

impl TopologyBuilder {
    /// Adds a computation; `mapping` binds the stream names of its metadata to topology streams
    /// (`"i1:input"`).
    pub fn add_computation<C, F>(mut self, supplier: F, mapping: &[&str]) -> Self
    where
        C: Computation + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let supplier: ComputationSupplier =
            Arc::new(move || Box::new(supplier()) as Box<dyn Computation>);
        self.computations
            .push((supplier, mapping.iter().map(|s| s.to_string()).collect()));
        self
    }

    pub fn add_stream(mut self, stream: impl Into<String>, partitions: u16) -> Self {
        self.streams.insert(stream.into(), partitions);
        self
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        let mut problems = Vec::new();
        if self.computations.is_empty() {
            problems.push(TopologyProblem::Empty);
        }
        for (stream, partitions) in &self.streams {
            if *partitions == 0 {
                problems.push(TopologyProblem::EmptyStream(stream.clone()));
            }
        }

        let mut nodes: BTreeMap<String, ComputationNode> = BTreeMap::new();
        for (supplier, entries) in self.computations {
            let declared = supplier().metadata();
            let mapping = match StreamMapping::parse(entries.as_slice()) {
                Ok(mapping) => mapping,
                Err(reason) => {
                    problems.push(TopologyProblem::InvalidMapping {
                        computation: declared.name().to_string(),
                        reason,
                    });
                    continue;
                }
            };
            let metadata = declared.mapped(&mapping);
            let name = metadata.name().to_string();
            for stream in metadata.inputs() {
                if !self.streams.contains_key(stream) {
                    problems.push(TopologyProblem::UndeclaredInput {
                        computation: name.clone(),
                        stream: stream.clone(),
                    });
                }
            }
            for stream in metadata.outputs() {
                if !self.streams.contains_key(stream) {
                    problems.push(TopologyProblem::UndeclaredOutput {
                        computation: name.clone(),
                        stream: stream.clone(),
                    });
                }
            }
            if nodes.contains_key(&name) {
                problems.push(TopologyProblem::DuplicateComputation(name));
                continue;
            }
            nodes.insert(
                name,
                ComputationNode {
                    metadata,
                    mapping: Arc::new(mapping),
                    supplier,
                },
            );
        }

        let edges = edges(&nodes);
        problems.extend(cyclic_edges(&nodes, &edges).into_iter().map(
            |(from, stream, to)| TopologyProblem::CyclicEdge { from, stream, to },
        ));
        if !problems.is_empty() {
            return Err(TopologyError::new(problems));
        }

        let order = topological_order(&nodes, &edges);
        Ok(Topology {
            nodes,
            order,
            streams: self.streams,
        })
    }
}

/// `(producer, stream, consumer)` triples.
fn edges(nodes: &BTreeMap<String, ComputationNode>) -> Vec<(String, String, String)> {
    let mut edges = Vec::new();
    for (from, producer) in nodes {
        for stream in producer.metadata.outputs() {
            for (to, consumer) in nodes {
                if consumer.metadata.inputs().contains(stream) {
                    edges.push((from.clone(), stream.clone(), to.clone()));
                }
            }
        }
    }
    edges
}

/// Edges whose two ends belong to the same strongly connected component (Tarjan).
fn cyclic_edges(
    nodes: &BTreeMap<String, ComputationNode>,
    edges: &[(String, String, String)],
) -> Vec<(String, String, String)> {
    struct Tarjan<'a> {
        adjacency: HashMap<&'a str, Vec<&'a str>>,
        index: HashMap<&'a str, usize>,
        low: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: BTreeSet<&'a str>,
        component: HashMap<&'a str, usize>,
        next_index: usize,
        next_component: usize,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &'a str) {
            self.index.insert(node, self.next_index);
            self.low.insert(node, self.next_index);
            self.next_index += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            let successors = self.adjacency.get(node).cloned().unwrap_or_default();
            for next in successors {
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.low[node].min(self.low[next]);
                    self.low.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.low[node].min(self.index[next]);
                    self.low.insert(node, low);
                }
            }

            if self.low[node] == self.index[node] {
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    self.component.insert(member, self.next_component);
                    if member == node {
                        break;
                    }
                }
                self.next_component += 1;
            }
        }
    }

    let mut tarjan = Tarjan {
        adjacency: HashMap::new(),
        index: HashMap::new(),
        low: HashMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        component: HashMap::new(),
        next_index: 0,
        next_component: 0,
    };
    for (from, _, to) in edges {
        tarjan
            .adjacency
            .entry(from.as_str())
            .or_default()
            .push(to.as_str());
    }
    for name in nodes.keys() {
        if !tarjan.index.contains_key(name.as_str()) {
            tarjan.visit(name);
        }
    }

    edges
        .iter()
        .filter(|(from, _, to)| {
            from == to || tarjan.component.get(from.as_str()) == tarjan.component.get(to.as_str())
        })
        .cloned()
        .collect()
}

/// Kahn's algorithm, ties broken by name so the order is stable.
fn topological_order(
    nodes: &BTreeMap<String, ComputationNode>,
    edges: &[(String, String, String)],
) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = nodes.keys().map(|n| (n.as_str(), 0)).collect();
    let mut successors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (from, _, to) in edges {
        if successors
            .entry(from.as_str())
            .or_default()
            .insert(to.as_str())
            && let Some(degree) = in_degree.get_mut(to.as_str())
        {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for &next in successors.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }
    order
}

/// A validated, acyclic graph of computations.
pub struct Topology {
    nodes: BTreeMap<String, ComputationNode>,
    /// computation names, upstream first
    order: Vec<String>,
    streams: BTreeMap<String, u16>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Computations, upstream first.
    pub fn computations(&self) -> impl Iterator<Item = &ComputationMetadata> + '_ {
        self.order
            .iter()
            .filter_map(|name| self.nodes.get(name))
            .map(|node| &node.metadata)
    }

    pub fn metadata(&self, computation: &str) -> Option<&ComputationMetadata> {
        self.nodes.get(computation).map(|node| &node.metadata)
    }

    pub(crate) fn node(&self, computation: &str) -> Option<&ComputationNode> {
        self.nodes.get(computation)
    }

    pub fn streams(&self) -> &BTreeMap<String, u16> {
        &self.streams
    }

    pub fn partitions(&self, stream: &str) -> Option<u16> {
        self.streams.get(stream).copied()
    }

    pub fn producers(&self, stream: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|node| node.metadata.outputs().iter().any(|s| s == stream))
            .map(|node| node.metadata.name())
            .collect()
    }

    pub fn consumers(&self, stream: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|node| node.metadata.inputs().iter().any(|s| s == stream))
            .map(|node| node.metadata.name())
            .collect()
    }

    /// A source runs a single task, any other computation one task per partition of its
    /// widest input stream.
    pub fn task_count(&self, computation: &str) -> u16 {
        let Some(metadata) = self.metadata(computation) else {
            return 0;
        };
        metadata
            .inputs()
            .iter()
            .filter_map(|stream| self.partitions(stream))
            .max()
            .unwrap_or(1)
    }

    /// Every task writing to `stream`.
    pub fn producer_tasks(&self, stream: &str) -> Vec<String> {
        self.producers(stream)
            .into_iter()
            .flat_map(|producer| {
                (0..self.task_count(producer)).map(move |partition| task_id(producer, partition))
            })
            .collect()
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for metadata in self.computations() {
            writeln!(f, "{metadata} x{}", self.task_count(metadata.name()))?;
        }
        for (stream, partitions) in &self.streams {
            writeln!(f, "{stream}[{partitions}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::computation::{ComputationContext, MappingError};
    use crate::error::Result;
    use crate::record::LogRecord;

    struct Noop(ComputationMetadata);

    #[async_trait]
    impl Computation for Noop {
        fn metadata(&self) -> ComputationMetadata {
            self.0.clone()
        }

        async fn process_record(
            &mut self,
            _ctx: &mut ComputationContext,
            _input_stream: &str,
            _record: &LogRecord,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn noop(name: &'static str, inputs: usize, outputs: usize) -> impl Fn() -> Noop {
        move || Noop(ComputationMetadata::with_arity(name, inputs, outputs))
    }

    #[test]
    fn builds_linear_topology() {
        let topology = Topology::builder()
            .add_stream("input", 1)
            .add_stream("middle", 4)
            .add_stream("output", 2)
            .add_computation(noop("C2", 1, 1), &["i1:middle", "o1:output"])
            .add_computation(noop("C1", 1, 1), &["i1:input", "o1:middle"])
            .add_computation(noop("GEN", 0, 1), &["o1:input"])
            .build()
            .unwrap();

        let order: Vec<_> = topology.computations().map(|m| m.name()).collect();
        assert_eq!(order, vec!["GEN", "C1", "C2"]);
        assert_eq!(topology.task_count("GEN"), 1);
        assert_eq!(topology.task_count("C1"), 1);
        assert_eq!(topology.task_count("C2"), 4);
        assert_eq!(topology.producers("middle"), vec!["C1"]);
        assert_eq!(topology.consumers("middle"), vec!["C2"]);
        assert_eq!(topology.producer_tasks("output"), vec!["C2:0", "C2:1", "C2:2", "C2:3"]);
        assert_eq!(topology.metadata("C1").unwrap().inputs(), ["input"]);
    }

    #[test]
    fn reports_every_undeclared_stream() {
        let err = Topology::builder()
            .add_stream("input", 1)
            .add_computation(noop("C1", 2, 1), &["i1:input", "i2:other", "o1:output"])
            .build()
            .err()
            .unwrap();
        assert_eq!(
            err.problems(),
            [
                TopologyProblem::UndeclaredInput {
                    computation: "C1".into(),
                    stream: "other".into()
                },
                TopologyProblem::UndeclaredOutput {
                    computation: "C1".into(),
                    stream: "output".into()
                },
            ]
        );
    }

    #[test]
    fn reports_every_cyclic_edge() {
        let err = Topology::builder()
            .add_stream("a", 1)
            .add_stream("b", 1)
            .add_stream("c", 1)
            .add_stream("out", 1)
            .add_computation(noop("A", 1, 1), &["i1:a", "o1:b"])
            .add_computation(noop("B", 1, 2), &["i1:b", "o1:a", "o2:out"])
            .add_computation(noop("S", 1, 1), &["i1:c", "o1:c"])
            .add_computation(noop("D", 1, 0), &["i1:out"])
            .build()
            .err()
            .unwrap();
        let cyclic: BTreeSet<_> = err.problems().iter().cloned().collect();
        let expected: BTreeSet<_> = [("A", "b", "B"), ("B", "a", "A"), ("S", "c", "S")]
            .into_iter()
            .map(|(from, stream, to)| TopologyProblem::CyclicEdge {
                from: from.into(),
                stream: stream.into(),
                to: to.into(),
            })
            .collect();
        assert_eq!(cyclic, expected);
        let message = err.to_string();
        assert!(message.contains("A -[b]-> B"));
        assert!(message.contains("S -[c]-> S"));
    }

    #[test]
    fn rejects_duplicates_and_bad_mappings() {
        let err = Topology::builder()
            .add_stream("s", 0)
            .add_computation(noop("C", 0, 1), &["o1:s"])
            .add_computation(noop("C", 0, 1), &["o1:s"])
            .add_computation(noop("M", 0, 1), &["nonsense"])
            .build()
            .err()
            .unwrap();
        assert!(err.problems().contains(&TopologyProblem::EmptyStream("s".into())));
        assert!(
            err.problems()
                .contains(&TopologyProblem::DuplicateComputation("C".into()))
        );
        assert!(err.problems().iter().any(|p| matches!(
            p,
            TopologyProblem::InvalidMapping {
                computation,
                reason: MappingError::Malformed(_),
            } if computation == "M"
        )));
    }

    #[test]
    fn empty_topology_is_invalid() {
        let err = Topology::builder().build().err().unwrap();
        assert_eq!(err.problems(), [TopologyProblem::Empty]);
    }
}
