//! Table dependency graph for FK-ordered execution.
//!
//! Provides:
//! - Dependency graph construction from schema FK relationships
//! - Depth-first post-order sort (referenced tables before referencing ones)
//! - Cycle detection; each cyclic group is kept together in first-seen order

use super::{SchemaInfo, TableId};
use ahash::AHashMap;

/// Mapping from each table to the tables it references via foreign key.
///
/// Self-references are dropped: rows of one table keep their file order, so a
/// table never has to wait for itself.
#[derive(Debug, Default, Clone)]
pub struct TableDependencyGraph {
    names: Vec<String>,
    index: AHashMap<String, TableId>,
    /// For each table, list of parent tables (tables this table references via FK)
    parents: Vec<Vec<TableId>>,
}

/// Result of the topological sort
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyOrder {
    /// Every table, referenced tables first
    pub order: Vec<String>,
    /// Groups of tables that reference each other in a cycle
    pub cyclic_groups: Vec<Vec<String>>,
}

impl DependencyOrder {
    /// All tables that are part of any cycle, in order
    pub fn cyclic_tables(&self) -> Vec<String> {
        self.cyclic_groups.iter().flatten().cloned().collect()
    }
}

impl TableDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from schema metadata, tables in schema order
    pub fn from_schema(schema: &SchemaInfo) -> Self {
        let mut graph = Self::new();
        for table in schema.iter() {
            graph.add_table(&table.name);
        }
        for table in schema.iter() {
            for referenced in &table.references {
                graph.add_dependency(&table.name, referenced);
            }
        }
        graph
    }

    pub fn add_table(&mut self, name: &str) -> TableId {
        let key = name.to_lowercase();
        if let Some(&id) = self.index.get(&key) {
            return id;
        }
        let id = TableId(self.names.len() as u32);
        self.index.insert(key.clone(), id);
        self.names.push(key);
        self.parents.push(Vec::new());
        id
    }

    /// `table` references `referenced`
    pub fn add_dependency(&mut self, table: &str, referenced: &str) {
        let child = self.add_table(table);
        let parent = self.add_table(referenced);
        if child != parent && !self.parents[child.0 as usize].contains(&parent) {
            self.parents[child.0 as usize].push(parent);
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.index.contains_key(&table.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Tables `table` references directly
    pub fn dependencies(&self, table: &str) -> Vec<&str> {
        self.index
            .get(&table.to_lowercase())
            .map(|id| {
                self.parents[id.0 as usize]
                    .iter()
                    .map(|p| self.names[p.0 as usize].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Depth-first post-order over strongly connected components.
    ///
    /// Each table is emitted after everything it references. Tables in a
    /// cycle form one group, emitted together in first-seen order at the
    /// point where the whole group's outside dependencies are satisfied.
    pub fn resolve(&self) -> DependencyOrder {
        let n = self.len();
        let mut tarjan = Tarjan {
            parents: &self.parents,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        };
        for v in 0..n {
            if tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }

        let mut result = DependencyOrder::default();
        for mut component in tarjan.components {
            component.sort_unstable();
            let names: Vec<String> = component
                .iter()
                .map(|&v| self.names[v].clone())
                .collect();
            if names.len() > 1 {
                result.cyclic_groups.push(names.clone());
            }
            result.order.extend(names);
        }
        result
    }
}

struct Tarjan<'a> {
    parents: &'a [Vec<TableId>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    /// Completed components, dependencies first
    components: Vec<Vec<usize>>,
}

impl Tarjan<'_> {
    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next);
        self.lowlink[v] = self.next;
        self.next += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let parents = self.parents;
        for p in &parents[v] {
            let w = p.0 as usize;
            match self.index[w] {
                None => {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(idx) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(idx);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
