//! Nested parameter containers.
//!
//! A [`ParamTree`] holds the free parameters of one sampler state. Leaves are
//! dense row-major `f64` arrays, inner nodes are either maps with string keys
//! or sequences. Everything the sampler does happens on the flattened vector;
//! the tree is only the user-facing shape of that vector.

use std::collections::BTreeMap;
use std::fmt::Display;

use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TreeError {
    #[error("parameter trees differ in structure at `{path}`: {reason}")]
    StructureMismatch { path: String, reason: String },
    #[error("leaf of shape {shape:?} needs {expected} values, got {actual}")]
    BadLeafLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("flat vector has length {actual}, tree needs {expected}")]
    BadFlatLength { expected: usize, actual: usize },
}

/// A dense array stored in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl Leaf {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, TreeError> {
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(TreeError::BadLeafLength {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Leaf { shape, values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A leaf of the same shape with new values.
    ///
    /// Panics if `values` has the wrong length.
    pub(crate) fn with_values(&self, values: Vec<f64>) -> Leaf {
        assert!(values.len() == self.values.len());
        Leaf {
            shape: self.shape.clone(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamTree {
    Leaf(Leaf),
    Map(BTreeMap<String, ParamTree>),
    Seq(Vec<ParamTree>),
}

/// The structure of a [`ParamTree`] without its values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeDef {
    Leaf(Vec<usize>),
    Map(BTreeMap<String, TreeDef>),
    Seq(Vec<TreeDef>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum PathItem {
    Key(String),
    Index(usize),
}

/// Location of a node inside a tree, rendered as `a.b[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreePath(Vec<PathItem>);

impl TreePath {
    fn push_key(&self, key: &str) -> TreePath {
        let mut items = self.0.clone();
        items.push(PathItem::Key(key.to_string()));
        TreePath(items)
    }

    fn push_index(&self, idx: usize) -> TreePath {
        let mut items = self.0.clone();
        items.push(PathItem::Index(idx));
        TreePath(items)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, item) in self.0.iter().enumerate() {
            match item {
                PathItem::Key(key) if i == 0 => write!(f, "{key}")?,
                PathItem::Key(key) => write!(f, ".{key}")?,
                PathItem::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl ParamTree {
    pub fn scalar(value: f64) -> Self {
        ParamTree::Leaf(Leaf {
            shape: vec![],
            values: vec![value],
        })
    }

    pub fn vector(values: Vec<f64>) -> Self {
        ParamTree::Leaf(Leaf {
            shape: vec![values.len()],
            values,
        })
    }

    pub fn array(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, TreeError> {
        Ok(ParamTree::Leaf(Leaf::new(shape, values)?))
    }

    pub fn map<K: Into<String>>(items: impl IntoIterator<Item = (K, ParamTree)>) -> Self {
        ParamTree::Map(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn seq(items: impl IntoIterator<Item = ParamTree>) -> Self {
        ParamTree::Seq(items.into_iter().collect())
    }

    /// Child of a map node.
    pub fn get(&self, key: &str) -> Option<&ParamTree> {
        match self {
            ParamTree::Map(items) => items.get(key),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ParamTree> {
        match self {
            ParamTree::Map(items) => items.get_mut(key),
            _ => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            ParamTree::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Leaf> {
        match self {
            ParamTree::Leaf(leaf) => Some(leaf),
            _ => None,
        }
    }

    /// Mutable values of a leaf node, `None` for inner nodes.
    ///
    /// Log densities use this to write gradients:
    /// `grad.get_mut("x").and_then(ParamTree::values_mut)`.
    pub fn values_mut(&mut self) -> Option<&mut [f64]> {
        self.as_leaf_mut().map(Leaf::values_mut)
    }

    /// The leaf at a rendered path such as `groups[0]`.
    pub fn leaf_at(&self, path: &str) -> Option<&Leaf> {
        self.leaves()
            .into_iter()
            .find(|(p, _)| p.to_string() == path)
            .map(|(_, leaf)| leaf)
    }

    /// The value of a leaf holding exactly one number.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ParamTree::Leaf(leaf) if leaf.values.len() == 1 => Some(leaf.values[0]),
            _ => None,
        }
    }

    pub fn treedef(&self) -> TreeDef {
        match self {
            ParamTree::Leaf(leaf) => TreeDef::Leaf(leaf.shape.clone()),
            ParamTree::Map(items) => {
                TreeDef::Map(items.iter().map(|(k, v)| (k.clone(), v.treedef())).collect())
            }
            ParamTree::Seq(items) => TreeDef::Seq(items.iter().map(|v| v.treedef()).collect()),
        }
    }

    /// All leaves in flattening order, together with their paths.
    pub fn leaves(&self) -> Vec<(TreePath, &Leaf)> {
        let mut out = Vec::new();
        self.collect_leaves(TreePath::default(), &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, path: TreePath, out: &mut Vec<(TreePath, &'a Leaf)>) {
        match self {
            ParamTree::Leaf(leaf) => out.push((path, leaf)),
            ParamTree::Map(items) => items
                .iter()
                .for_each(|(k, v)| v.collect_leaves(path.push_key(k), out)),
            ParamTree::Seq(items) => items
                .iter()
                .enumerate()
                .for_each(|(i, v)| v.collect_leaves(path.push_index(i), out)),
        }
    }

    pub fn num_leaves(&self) -> usize {
        match self {
            ParamTree::Leaf(_) => 1,
            ParamTree::Map(items) => items.values().map(|v| v.num_leaves()).sum(),
            ParamTree::Seq(items) => items.iter().map(|v| v.num_leaves()).sum(),
        }
    }

    /// Number of scalars stored in the tree.
    pub fn size(&self) -> usize {
        match self {
            ParamTree::Leaf(leaf) => leaf.values.len(),
            ParamTree::Map(items) => items.values().map(|v| v.size()).sum(),
            ParamTree::Seq(items) => items.iter().map(|v| v.size()).sum(),
        }
    }

    pub fn map_leaves(&self, mut func: impl FnMut(&Leaf) -> Leaf) -> ParamTree {
        self.map_leaves_inner(&mut func)
    }

    fn map_leaves_inner(&self, func: &mut impl FnMut(&Leaf) -> Leaf) -> ParamTree {
        match self {
            ParamTree::Leaf(leaf) => ParamTree::Leaf(func(leaf)),
            ParamTree::Map(items) => ParamTree::Map(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.map_leaves_inner(func)))
                    .collect(),
            ),
            ParamTree::Seq(items) => {
                ParamTree::Seq(items.iter().map(|v| v.map_leaves_inner(func)).collect())
            }
        }
    }

    /// Combine two trees of identical structure leaf by leaf.
    ///
    /// Fails on the first node (in flattening order) where the structures
    /// differ, including leaves with different shapes.
    pub fn try_zip_map<E>(
        &self,
        other: &ParamTree,
        mut func: impl FnMut(&Leaf, &Leaf) -> Result<Leaf, E>,
    ) -> Result<ParamTree, E>
    where
        E: From<TreeError>,
    {
        self.zip_map_inner(other, TreePath::default(), &mut func)
    }

    fn zip_map_inner<E>(
        &self,
        other: &ParamTree,
        path: TreePath,
        func: &mut impl FnMut(&Leaf, &Leaf) -> Result<Leaf, E>,
    ) -> Result<ParamTree, E>
    where
        E: From<TreeError>,
    {
        let mismatch = |reason: String| TreeError::StructureMismatch {
            path: path.to_string(),
            reason,
        };
        match (self, other) {
            (ParamTree::Leaf(a), ParamTree::Leaf(b)) => {
                if a.shape != b.shape {
                    return Err(mismatch(format!(
                        "leaf shapes {:?} and {:?}",
                        a.shape, b.shape
                    ))
                    .into());
                }
                Ok(ParamTree::Leaf(func(a, b)?))
            }
            (ParamTree::Map(a), ParamTree::Map(b)) => {
                if !a.keys().eq(b.keys()) {
                    return Err(mismatch(format!(
                        "map keys {:?} and {:?}",
                        a.keys().collect::<Vec<_>>(),
                        b.keys().collect::<Vec<_>>()
                    ))
                    .into());
                }
                let items = a
                    .iter()
                    .zip(b.values())
                    .map(|((k, a), b)| Ok((k.clone(), a.zip_map_inner(b, path.push_key(k), func)?)))
                    .collect::<Result<BTreeMap<_, _>, E>>()?;
                Ok(ParamTree::Map(items))
            }
            (ParamTree::Seq(a), ParamTree::Seq(b)) => {
                if a.len() != b.len() {
                    return Err(mismatch(format!(
                        "sequence lengths {} and {}",
                        a.len(),
                        b.len()
                    ))
                    .into());
                }
                let items = a
                    .iter()
                    .zip(b)
                    .enumerate()
                    .map(|(i, (a, b))| a.zip_map_inner(b, path.push_index(i), func))
                    .collect::<Result<Vec<_>, E>>()?;
                Ok(ParamTree::Seq(items))
            }
            (a, b) => Err(mismatch(format!("{} and {}", a.kind(), b.kind())).into()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ParamTree::Leaf(_) => "leaf",
            ParamTree::Map(_) => "map",
            ParamTree::Seq(_) => "sequence",
        }
    }

    pub fn zeros_like(&self) -> ParamTree {
        self.map_leaves(|leaf| leaf.with_values(vec![0f64; leaf.len()]))
    }

    pub fn flatten(&self) -> (Vec<f64>, TreeDef) {
        let mut out = vec![0f64; self.size()];
        self.write_flat(&mut out);
        (out, self.treedef())
    }

    /// Write all values into `out` in flattening order.
    ///
    /// Panics if `out.len() != self.size()`.
    pub fn write_flat(&self, out: &mut [f64]) {
        assert!(out.len() == self.size());
        let mut offset = 0;
        for (_, leaf) in self.leaves() {
            out[offset..offset + leaf.len()].copy_from_slice(&leaf.values);
            offset += leaf.len();
        }
    }

    /// Overwrite all values from a flat vector, keeping the structure.
    pub fn assign_flat(&mut self, values: &[f64]) -> Result<(), TreeError> {
        let expected = self.size();
        if values.len() != expected {
            return Err(TreeError::BadFlatLength {
                expected,
                actual: values.len(),
            });
        }
        self.assign_inner(values);
        Ok(())
    }

    /// Like [`ParamTree::assign_flat`] for callers that already checked the length.
    pub(crate) fn copy_from_flat(&mut self, values: &[f64]) {
        assert!(values.len() == self.size());
        self.assign_inner(values);
    }

    pub fn fill(&mut self, value: f64) {
        match self {
            ParamTree::Leaf(leaf) => leaf.values.fill(value),
            ParamTree::Map(items) => items.values_mut().for_each(|v| v.fill(value)),
            ParamTree::Seq(items) => items.iter_mut().for_each(|v| v.fill(value)),
        }
    }

    fn assign_inner<'a>(&mut self, values: &'a [f64]) -> &'a [f64] {
        match self {
            ParamTree::Leaf(leaf) => {
                let (head, tail) = values.split_at(leaf.values.len());
                leaf.values.copy_from_slice(head);
                tail
            }
            ParamTree::Map(items) => items
                .values_mut()
                .fold(values, |rest, item| item.assign_inner(rest)),
            ParamTree::Seq(items) => items
                .iter_mut()
                .fold(values, |rest, item| item.assign_inner(rest)),
        }
    }
}

impl TreeDef {
    pub fn size(&self) -> usize {
        match self {
            TreeDef::Leaf(shape) => shape.iter().product(),
            TreeDef::Map(items) => items.values().map(|v| v.size()).sum(),
            TreeDef::Seq(items) => items.iter().map(|v| v.size()).sum(),
        }
    }

    /// Rebuild a tree of this structure from a flat vector.
    pub fn unflatten(&self, values: &[f64]) -> Result<ParamTree, TreeError> {
        let expected = self.size();
        if values.len() != expected {
            return Err(TreeError::BadFlatLength {
                expected,
                actual: values.len(),
            });
        }
        Ok(self.unflatten_inner(&mut values.iter().copied()))
    }

    fn unflatten_inner(&self, values: &mut impl Iterator<Item = f64>) -> ParamTree {
        match self {
            TreeDef::Leaf(shape) => {
                let len = shape.iter().product();
                ParamTree::Leaf(Leaf {
                    shape: shape.clone(),
                    values: values.take(len).collect(),
                })
            }
            TreeDef::Map(items) => ParamTree::Map(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.unflatten_inner(values)))
                    .collect(),
            ),
            TreeDef::Seq(items) => {
                ParamTree::Seq(items.iter().map(|v| v.unflatten_inner(values)).collect())
            }
        }
    }
}

impl From<f64> for ParamTree {
    fn from(value: f64) -> Self {
        ParamTree::scalar(value)
    }
}

impl From<Vec<f64>> for ParamTree {
    fn from(values: Vec<f64>) -> Self {
        ParamTree::vector(values)
    }
}
