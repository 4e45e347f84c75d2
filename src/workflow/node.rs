//! The compiled, immutable task graph.
//!
//! Built once from a definition's parsed [`Task`] tree and then shared
//! read-only across every instance of that workflow version (spec §9:
//! "Global mutable state ... The workflow definition cache and compiled
//! Node graphs are process-wide immutable after first load"). Parent links
//! are [`Position`] values, never ownership edges, so the graph has no
//! cycles despite Node/NodeInstance forming one conceptually.

use std::collections::HashMap;

use crate::position::{Position, Token};
use crate::workflow::error::WorkflowError;
use crate::workflow::task::{CatchSpec, NamedTask, Task};

/// One compiled node: its canonical position, short name, task payload and
/// the position of the list (`do`/`for.do`/`try.do`/`catch.do`/`fork`) it
/// was declared in, used to resolve named `then` jumps.
#[derive(Debug, Clone)]
pub struct Node {
    pub position: Position,
    pub name: String,
    pub task: Task,
    pub scope: Position,
}

/// The compiled workflow: a flat `Position -> Node` index plus the ordered
/// sibling lists ("scopes") that named `then` directives resolve against.
#[derive(Debug)]
pub struct CompiledWorkflow {
    nodes: HashMap<Position, Node>,
    scopes: HashMap<Position, Vec<(String, Position)>>,
    catches: HashMap<Position, CatchSpec>,
    root: Position,
}

impl CompiledWorkflow {
    /// Compile a parsed `Task` tree rooted at the workflow's top-level
    /// `do` (or whichever task kind is used at the root) into a graph.
    pub fn compile(root_task: Task) -> Result<Self, WorkflowError> {
        let mut builder = Builder::default();
        let root = Position::root();
        builder.compile_task(&root, "", root.clone(), root_task)?;
        Ok(CompiledWorkflow {
            nodes: builder.nodes,
            scopes: builder.scopes,
            catches: builder.catches,
            root,
        })
    }

    pub fn root(&self) -> &Position {
        &self.root
    }

    pub fn root_node(&self) -> &Node {
        self.nodes
            .get(&self.root)
            .expect("compile always inserts the root node")
    }

    pub fn get(&self, position: &Position) -> Option<&Node> {
        self.nodes.get(position)
    }

    pub fn catch_spec(&self, try_position: &Position) -> Option<&CatchSpec> {
        self.catches.get(try_position)
    }

    /// Resolve a named `then` target against the list `scope` belongs to.
    pub fn resolve_then(&self, scope: &Position, name: &str) -> Option<Position> {
        self.scopes
            .get(scope)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, pos)| pos.clone())
    }

    /// The ordered siblings of `scope`, for "next by position" lookups.
    pub fn scope_children(&self, scope: &Position) -> &[(String, Position)] {
        self.scopes
            .get(scope)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Default)]
struct Builder {
    nodes: HashMap<Position, Node>,
    scopes: HashMap<Position, Vec<(String, Position)>>,
    catches: HashMap<Position, CatchSpec>,
}

impl Builder {
    fn compile_task(
        &mut self,
        position: &Position,
        name: &str,
        scope: Position,
        task: Task,
    ) -> Result<(), WorkflowError> {
        match &task {
            Task::Do(t) => {
                let list = position.child_token(Token::Do);
                self.compile_list(&list, &t.children)?;
            }
            Task::For(t) => {
                let list = position.child_token(Token::For).child_token(Token::Do);
                self.compile_list(&list, &t.children)?;
            }
            Task::Try(t) => {
                let try_do = position.child_token(Token::Try).child_token(Token::Do);
                self.compile_list(&try_do, &t.children)?;

                let catch_pos = position.child_token(Token::Try).child_token(Token::Catch);
                let catch_do = catch_pos.child_token(Token::Do);
                self.compile_list(&catch_do, &t.catch.children)?;
                self.catches.insert(position.clone(), t.catch.clone());
            }
            Task::Switch(t) => {
                if t.switch.is_empty() {
                    return Err(WorkflowError::configuration(
                        "switch task must declare at least one case",
                    )
                    .at(position));
                }
            }
            Task::Fork(t) => {
                let list = position.child_token(Token::Fork);
                self.compile_list(&list, &t.fork.branches)?;
            }
            Task::Set(_)
            | Task::Raise(_)
            | Task::Wait(_)
            | Task::CallHttp(_)
            | Task::RunScript(_)
            | Task::RunShell(_)
            | Task::RunWorkflow(_)
            | Task::Emit(_)
            | Task::Listen(_) => {}
        }

        self.nodes.insert(
            position.clone(),
            Node {
                position: position.clone(),
                name: name.to_string(),
                task,
                scope,
            },
        );
        Ok(())
    }

    fn compile_list(
        &mut self,
        list: &Position,
        children: &[NamedTask],
    ) -> Result<(), WorkflowError> {
        let mut ordered = Vec::with_capacity(children.len());
        for (i, named) in children.iter().enumerate() {
            let child_pos = list.child_index(i).child_name(&named.name);
            ordered.push((named.name.clone(), child_pos.clone()));
            self.compile_task(&child_pos, &named.name, list.clone(), named.task.clone())?;
        }
        self.scopes.insert(list.clone(), ordered);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::task::{DoTask, NamedTask, SetTask, TaskBase, Valuable};
    use std::collections::BTreeMap;

    fn set_task(value: &str) -> Task {
        let mut set = BTreeMap::new();
        set.insert(
            "value".to_string(),
            Valuable::Literal(serde_json::json!(value)),
        );
        Task::Set(SetTask {
            base: TaskBase::default(),
            set,
            merge: false,
        })
    }

    fn do_task(children: Vec<(&str, Task)>) -> Task {
        Task::Do(DoTask {
            base: TaskBase::default(),
            children: children
                .into_iter()
                .map(|(name, task)| NamedTask {
                    name: name.to_string(),
                    task,
                })
                .collect(),
        })
    }

    #[test]
    fn compiles_canonical_positions_for_do_children() {
        let wf = do_task(vec![("a", set_task("1")), ("b", set_task("2"))]);
        let compiled = CompiledWorkflow::compile(wf).unwrap();

        let a_pos = Position::root().child_token(Token::Do).child_index(0).child_name("a");
        let b_pos = Position::root().child_token(Token::Do).child_index(1).child_name("b");

        assert!(compiled.get(&a_pos).is_some());
        assert!(compiled.get(&b_pos).is_some());
    }

    #[test]
    fn resolves_named_then_within_the_same_scope() {
        let wf = do_task(vec![
            ("first", set_task("1")),
            ("second", set_task("2")),
            ("third", set_task("3")),
        ]);
        let compiled = CompiledWorkflow::compile(wf).unwrap();

        let scope = Position::root().child_token(Token::Do);
        let resolved = compiled.resolve_then(&scope, "third").unwrap();
        assert_eq!(
            resolved,
            scope.child_index(2).child_name("third")
        );
        assert!(compiled.resolve_then(&scope, "missing").is_none());
    }

    #[test]
    fn switch_without_cases_fails_compile() {
        use crate::workflow::task::SwitchTask;
        let task = Task::Switch(SwitchTask {
            base: TaskBase::default(),
            switch: vec![],
        });
        let err = CompiledWorkflow::compile(task).unwrap_err();
        assert_eq!(err.kind, crate::workflow::error::ErrorKind::Configuration);
    }
}
