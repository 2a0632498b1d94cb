use std::fmt;
use std::sync::Arc;

use crate::error::{Error, TmResult};
use crate::grammars::{CompiledGrammar, GlobalRuleRef, ROOT_RULE_ID};
use crate::scope::Scope;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    /// Rule that created this frame
    pub rule_ref: GlobalRuleRef,
    /// Outer scopes + the rule `name`, applied to begin/end delimiters
    pub name_scopes: Vec<Scope>,
    /// `name_scopes` + the rule `contentName`, applied between the delimiters
    pub content_scopes: Vec<Scope>,
    /// End/while pattern with its back-references replaced by the begin captures
    pub end_pattern: Option<String>,
    /// The begin match consumed the end of line: `\G` matches at 0 on the next line
    pub begin_rule_has_captured_eol: bool,
    /// Anchor position before this frame was pushed, restored when it's popped
    pub anchor_position: Option<usize>,
    /// Where the rule was entered in the current line, `None` for frames from previous lines
    pub enter_position: Option<usize>,
}

impl StackFrame {
    fn root(grammar: &CompiledGrammar) -> Self {
        Self {
            rule_ref: GlobalRuleRef {
                grammar: grammar.id,
                rule: ROOT_RULE_ID,
            },
            name_scopes: vec![grammar.scope],
            content_scopes: vec![grammar.scope],
            end_pattern: None,
            begin_rule_has_captured_eol: false,
            anchor_position: None,
            enter_position: None,
        }
    }

    fn has_line_positions(&self) -> bool {
        self.anchor_position.is_some() || self.enter_position.is_some()
    }
}

#[derive(Debug)]
struct Node {
    frame: StackFrame,
    parent: Option<Arc<Node>>,
    depth: usize,
}

/// The parse state carried from one line to the next.
///
/// Stacks are persistent: pushing or popping returns a new stack sharing its frames with the
/// original one, which stays valid. Editors keep one per line and re-tokenize from any of them.
#[derive(Clone)]
pub struct StateStack {
    node: Arc<Node>,
    /// Only the stack starting a document is on its first line: `\A` can match
    first_line: bool,
}

impl StateStack {
    /// The state before the first line of a document
    pub fn initial(grammar: &CompiledGrammar) -> Self {
        Self {
            node: Arc::new(Node {
                frame: StackFrame::root(grammar),
                parent: None,
                depth: 1,
            }),
            first_line: true,
        }
    }

    pub fn push(&self, frame: StackFrame) -> Self {
        Self {
            node: Arc::new(Node {
                frame,
                depth: self.node.depth + 1,
                parent: Some(self.node.clone()),
            }),
            first_line: self.first_line,
        }
    }

    /// Returns the top frame and the stack below it. The root frame is never popped.
    pub fn pop(&self) -> TmResult<(StackFrame, Self)> {
        let parent = self.node.parent.clone().ok_or(Error::EmptyStack)?;
        Ok((
            self.node.frame.clone(),
            Self {
                node: parent,
                first_line: self.first_line,
            },
        ))
    }

    /// Scopes of text at the current position, outermost first
    pub fn scopes(&self) -> &[Scope] {
        &self.node.frame.content_scopes
    }

    pub fn top(&self) -> &StackFrame {
        &self.node.frame
    }

    /// Number of frames, 1 for a stack holding only the grammar root
    pub fn depth(&self) -> usize {
        self.node.depth
    }

    pub fn is_first_line(&self) -> bool {
        self.first_line
    }

    /// Returns a copy of this stack with its top frame modified
    pub fn with_top(&self, f: impl FnOnce(&mut StackFrame)) -> Self {
        let mut frame = self.node.frame.clone();
        f(&mut frame);
        Self {
            node: Arc::new(Node {
                frame,
                parent: self.node.parent.clone(),
                depth: self.node.depth,
            }),
            first_line: self.first_line,
        }
    }

    /// Whether `rule_ref` was pushed at `pos` in the current line and is still on the stack
    pub fn has_rule_entered_at(&self, rule_ref: GlobalRuleRef, pos: usize) -> bool {
        self.nodes()
            .any(|n| n.frame.rule_ref == rule_ref && n.frame.enter_position == Some(pos))
    }

    /// Every stack from the root alone up to this one
    pub fn ancestors(&self) -> Vec<StateStack> {
        let mut out: Vec<_> = self
            .node_arcs()
            .map(|node| StateStack {
                node,
                first_line: self.first_line,
            })
            .collect();
        out.reverse();
        out
    }

    /// Stack to hand to the next line: the positions are only meaningful inside
    /// the line they were recorded in. Frames that have none are shared.
    pub fn reset(&self) -> Self {
        Self {
            node: reset_node(&self.node),
            first_line: false,
        }
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        std::iter::successors(Some(self.node.as_ref()), |n| n.parent.as_deref())
    }

    fn node_arcs(&self) -> impl Iterator<Item = Arc<Node>> {
        std::iter::successors(Some(self.node.clone()), |n| n.parent.clone())
    }
}

fn reset_node(node: &Arc<Node>) -> Arc<Node> {
    let parent = node.parent.as_ref().map(reset_node);
    let parent_shared = match (&parent, &node.parent) {
        (Some(new), Some(old)) => Arc::ptr_eq(new, old),
        _ => true,
    };

    if parent_shared && !node.frame.has_line_positions() {
        return node.clone();
    }

    Arc::new(Node {
        frame: StackFrame {
            anchor_position: None,
            enter_position: None,
            ..node.frame.clone()
        },
        parent,
        depth: node.depth,
    })
}

impl PartialEq for StateStack {
    fn eq(&self, other: &Self) -> bool {
        if self.first_line != other.first_line || self.node.depth != other.node.depth {
            return false;
        }

        let mut a = Some(&self.node);
        let mut b = Some(&other.node);
        while let (Some(x), Some(y)) = (a, b) {
            if Arc::ptr_eq(x, y) {
                return true;
            }
            if x.frame != y.frame {
                return false;
            }
            a = x.parent.as_ref();
            b = y.parent.as_ref();
        }
        a.is_none() && b.is_none()
    }
}

impl Eq for StateStack {}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StateStack (first_line={}):", self.first_line)?;

        for (depth, stack) in self.ancestors().iter().enumerate() {
            let frame = stack.top();
            let indent = "  ".repeat(depth);
            let join = |scopes: &[Scope]| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            write!(
                f,
                "{indent}grammar={}, rule={} name=[{}], content=[{}]",
                frame.rule_ref.grammar.0,
                frame.rule_ref.rule.0,
                join(&frame.name_scopes),
                join(&frame.content_scopes),
            )?;
            if let Some(pattern) = &frame.end_pattern {
                write!(f, ", end_pattern={pattern:?}")?;
            }
            writeln!(
                f,
                ", anchor_pos={:?}, enter_pos={:?}, captured_eol={}",
                frame.anchor_position, frame.enter_position, frame.begin_rule_has_captured_eol
            )?;
        }

        Ok(())
    }
}
