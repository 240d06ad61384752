//! Conversion of chain results into an inference-data container.
//!
//! Every variable is stored as one flat arrow array in row-major order over
//! its dimensions, which always start with `chain` and `draw`.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayBuilder, ArrayRef, BooleanBuilder, FixedSizeListArray, FixedSizeListBuilder,
    Float64Array, Float64Builder, Int64Builder, RecordBatch, RecordBatchOptions, UInt64Builder,
};
use arrow::buffer::NullBuffer;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use thiserror::Error;

use crate::chains::ChainRun;
use crate::state::SampleStatValue;

/// Labels of the coordinates of a dimension, by dimension name.
pub type Coords = BTreeMap<String, Vec<String>>;
/// Names of the non-chain, non-draw dimensions, by variable name.
pub type Dims = BTreeMap<String, Vec<String>>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IdataError {
    #[error("The run contains no draws")]
    EmptyRun,
    #[error("Dims for `{var}` name {actual} dimensions, the variable has {expected}")]
    BadDims {
        var: String,
        expected: usize,
        actual: usize,
    },
    #[error("Dims given for unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("Coordinate `{dim}` has {actual} labels, the dimension has length {expected}")]
    BadCoords {
        dim: String,
        expected: usize,
        actual: usize,
    },
    #[error("Chains have different numbers of draws")]
    RaggedChains,
    #[error("Could not build arrow arrays")]
    Arrow(#[from] ArrowError),
}

#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    dims: Vec<String>,
    shape: Vec<usize>,
    values: ArrayRef,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &ArrayRef {
        &self.values
    }

    /// The values of a floating point variable.
    pub fn as_f64(&self) -> Option<&[f64]> {
        self.values
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|array| array.values().as_ref())
    }

    /// Number of values per draw.
    fn item_size(&self) -> usize {
        self.shape[2..].iter().product()
    }
}

/// A set of variables sharing the `chain` and `draw` dimensions.
#[derive(Debug, Clone)]
pub struct Group {
    n_chains: usize,
    n_draws: usize,
    variables: Vec<Variable>,
}

impl Group {
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn n_draws(&self) -> usize {
        self.n_draws
    }

    /// The group as a table with one row per draw: `chain` and `draw`
    /// columns, followed by one column per variable. Variables with more
    /// dimensions become fixed size lists.
    pub fn to_record_batch(&self) -> Result<RecordBatch, IdataError> {
        let n_rows = self.n_chains * self.n_draws;
        let mut chain = UInt64Builder::with_capacity(n_rows);
        let mut draw = UInt64Builder::with_capacity(n_rows);
        for c in 0..self.n_chains {
            for d in 0..self.n_draws {
                chain.append_value(c as u64);
                draw.append_value(d as u64);
            }
        }

        let mut fields = vec![
            Field::new("chain", DataType::UInt64, false),
            Field::new("draw", DataType::UInt64, false),
        ];
        let mut columns: Vec<ArrayRef> = vec![
            ArrayBuilder::finish(&mut chain),
            ArrayBuilder::finish(&mut draw),
        ];

        for var in self.variables.iter() {
            if var.shape.len() == 2 {
                fields.push(Field::new(&var.name, var.values.data_type().clone(), true));
                columns.push(var.values.clone());
                continue;
            }
            let values = var.as_f64().ok_or_else(|| {
                ArrowError::InvalidArgumentError(format!(
                    "Variable {} is not a float array",
                    var.name
                ))
            })?;
            let size = var.item_size();
            let column: ArrayRef = if size == 0 {
                // A zero sized list only knows its length through the null buffer.
                Arc::new(FixedSizeListArray::try_new(
                    Arc::new(Field::new("item", DataType::Float64, true)),
                    0,
                    Arc::new(Float64Array::from(Vec::<f64>::new())),
                    Some(NullBuffer::new_valid(n_rows)),
                )?)
            } else {
                let mut builder = FixedSizeListBuilder::new(
                    Float64Builder::with_capacity(values.len()),
                    size as i32,
                );
                for row in 0..n_rows {
                    builder
                        .values()
                        .append_slice(&values[row * size..(row + 1) * size]);
                    builder.append(true);
                }
                ArrayBuilder::finish(&mut builder)
            };
            fields.push(Field::new(&var.name, column.data_type().clone(), false));
            columns.push(column);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(n_rows));
        Ok(RecordBatch::try_new_with_options(
            Arc::new(Schema::new(fields)),
            columns,
            &options,
        )?)
    }
}

/// Posterior draws and sampler statistics of a multi-chain run.
#[derive(Debug, Clone)]
pub struct InferenceData {
    pub posterior: Group,
    pub sample_stats: Group,
    /// Coordinate labels by dimension, including `chain` and `draw`.
    pub coords: Coords,
}

/// Collect a run into a `posterior` group (one variable per parameter leaf)
/// and a `sample_stats` group (one variable per step statistic).
///
/// Variables are named by their tree path. Extra dimensions default to
/// `{var}_dim_{i}` and can be renamed through `dims`. `coords` attaches
/// labels to dimensions. `chain` and `draw` are labelled `0..n` unless
/// `coords` names them.
pub fn get_idata(
    run: &ChainRun,
    coords: Option<&Coords>,
    dims: Option<&Dims>,
) -> Result<InferenceData, IdataError> {
    let n_chains = run.n_chains();
    let n_draws = run.n_samples();
    let first = run
        .chains()
        .first()
        .and_then(|chain| chain.states.first().zip(chain.infos.first()))
        .ok_or(IdataError::EmptyRun)?;
    if run
        .chains()
        .iter()
        .any(|c| c.states.len() != n_draws || c.infos.len() != n_draws)
    {
        return Err(IdataError::RaggedChains);
    }

    let empty = Dims::new();
    let dims = dims.unwrap_or(&empty);
    let leaves = first.0.position.leaves();
    if let Some(unknown) = dims
        .keys()
        .find(|name| !leaves.iter().any(|(path, _)| path.to_string() == **name))
    {
        return Err(IdataError::UnknownVariable(unknown.clone()));
    }

    let mut var_dims = Vec::with_capacity(leaves.len());
    for (path, leaf) in leaves.iter() {
        let name = path.to_string();
        let names = match dims.get(&name) {
            Some(names) if names.len() != leaf.shape().len() => {
                return Err(IdataError::BadDims {
                    var: name,
                    expected: leaf.shape().len(),
                    actual: names.len(),
                })
            }
            Some(names) => names.clone(),
            None => (0..leaf.shape().len())
                .map(|i| format!("{name}_dim_{i}"))
                .collect(),
        };
        var_dims.push((name, names));
    }

    let mut builders: Vec<Float64Builder> = leaves
        .iter()
        .map(|(_, leaf)| Float64Builder::with_capacity(n_chains * n_draws * leaf.len()))
        .collect();
    for state in run.chains().iter().flat_map(|c| c.states.iter()) {
        let state_leaves = state.position.leaves();
        if state_leaves.len() != leaves.len() {
            return Err(IdataError::RaggedChains);
        }
        for ((builder, (_, expected)), (_, leaf)) in
            builders.iter_mut().zip(leaves.iter()).zip(state_leaves)
        {
            if leaf.shape() != expected.shape() {
                return Err(IdataError::RaggedChains);
            }
            builder.append_slice(leaf.values());
        }
    }

    let posterior = leaves
        .iter()
        .zip(var_dims)
        .zip(builders.iter_mut())
        .map(|(((_, leaf), (name, names)), builder)| Variable {
            dims: ["chain", "draw"]
                .into_iter()
                .map(String::from)
                .chain(names)
                .collect(),
            shape: [n_chains, n_draws]
                .into_iter()
                .chain(leaf.shape().iter().copied())
                .collect(),
            values: ArrayBuilder::finish(builder),
            name,
        })
        .collect();

    let mut stats: BTreeMap<&'static str, Vec<SampleStatValue>> = first
        .1
        .as_map()
        .keys()
        .map(|&name| (name, Vec::with_capacity(n_chains * n_draws)))
        .collect();
    for info in run.chains().iter().flat_map(|c| c.infos.iter()) {
        for (name, value) in info.as_map() {
            if let Some(values) = stats.get_mut(name) {
                values.push(value);
            }
        }
    }
    let sample_stats = stats
        .into_iter()
        .map(|(name, values)| Variable {
            name: name.to_string(),
            dims: vec!["chain".into(), "draw".into()],
            shape: vec![n_chains, n_draws],
            values: stat_array(&values),
        })
        .collect();

    let posterior = Group {
        n_chains,
        n_draws,
        variables: posterior,
    };
    let coords = build_coords(&posterior, coords, n_chains, n_draws)?;

    Ok(InferenceData {
        posterior,
        sample_stats: Group {
            n_chains,
            n_draws,
            variables: sample_stats,
        },
        coords,
    })
}

fn stat_array(values: &[SampleStatValue]) -> ArrayRef {
    use SampleStatValue::*;

    match values.first() {
        Some(U64(_)) => {
            let mut builder = UInt64Builder::with_capacity(values.len());
            values.iter().for_each(|v| match v {
                U64(x) => builder.append_value(*x),
                _ => builder.append_null(),
            });
            ArrayBuilder::finish(&mut builder)
        }
        Some(I64(_)) => {
            let mut builder = Int64Builder::with_capacity(values.len());
            values.iter().for_each(|v| match v {
                I64(x) => builder.append_value(*x),
                _ => builder.append_null(),
            });
            ArrayBuilder::finish(&mut builder)
        }
        Some(Bool(_)) => {
            let mut builder = BooleanBuilder::with_capacity(values.len());
            values.iter().for_each(|v| match v {
                Bool(x) => builder.append_value(*x),
                _ => builder.append_null(),
            });
            ArrayBuilder::finish(&mut builder)
        }
        Some(F64(_)) | None => {
            let mut builder = Float64Builder::with_capacity(values.len());
            values.iter().for_each(|v| match v {
                F64(x) => builder.append_value(*x),
                _ => builder.append_null(),
            });
            ArrayBuilder::finish(&mut builder)
        }
    }
}

fn build_coords(
    posterior: &Group,
    coords: Option<&Coords>,
    n_chains: usize,
    n_draws: usize,
) -> Result<Coords, IdataError> {
    let mut sizes: BTreeMap<&str, usize> =
        BTreeMap::from([("chain", n_chains), ("draw", n_draws)]);
    for var in posterior.variables.iter() {
        for (dim, &len) in var.dims.iter().zip(var.shape.iter()).skip(2) {
            sizes.insert(dim, len);
        }
    }

    let mut out = Coords::new();
    for (dim, labels) in coords.into_iter().flatten() {
        if let Some(&expected) = sizes.get(dim.as_str()) {
            if expected != labels.len() {
                return Err(IdataError::BadCoords {
                    dim: dim.clone(),
                    expected,
                    actual: labels.len(),
                });
            }
        }
        out.insert(dim.clone(), labels.clone());
    }
    out.entry("chain".into())
        .or_insert_with(|| (0..n_chains).map(|i| i.to_string()).collect());
    out.entry("draw".into())
        .or_insert_with(|| (0..n_draws).map(|i| i.to_string()).collect());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chains::{ChainRun, ChainTrace};
    use crate::state::{SampleState, StepInfo, TunedParams};
    use crate::tree::ParamTree;
    use arrow::array::{BooleanArray, FixedSizeListArray, UInt64Array};
    use pretty_assertions::assert_eq;

    fn fake_run(n_chains: usize, n_draws: usize) -> ChainRun {
        let chains = (0..n_chains)
            .map(|chain| {
                let states = (0..n_draws)
                    .map(|draw| {
                        let v = (chain * 100 + draw) as f64;
                        let position = ParamTree::map([
                            ("mu", ParamTree::scalar(v)),
                            ("theta", ParamTree::vector(vec![v, -v])),
                        ]);
                        SampleState {
                            logdensity_grad: position.zeros_like(),
                            position,
                            logdensity: -v,
                        }
                    })
                    .collect();
                let infos = (0..n_draws)
                    .map(|draw| StepInfo {
                        acceptance_rate: 0.9,
                        is_divergent: draw == 1,
                        is_turning: true,
                        energy: 1.,
                        energy_error: 0.,
                        num_trajectory_expansions: 2,
                        num_integration_steps: 3,
                        reached_max_depth: false,
                        index_in_trajectory: 1,
                        step_size: 0.5,
                        divergence_info: None,
                    })
                    .collect();
                ChainTrace {
                    chain,
                    states,
                    infos,
                    tuned: TunedParams {
                        step_size: 0.5,
                        inverse_mass_matrix: vec![1.; 3].into(),
                        max_tree_depth: 10,
                        max_energy_error: 1000.,
                    },
                }
            })
            .collect();
        ChainRun::new(chains)
    }

    #[test]
    fn posterior_layout() {
        let idata = get_idata(&fake_run(2, 3), None, None).unwrap();
        let names: Vec<_> = idata.posterior.variables().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["mu", "theta"]);

        let theta = idata.posterior.get("theta").unwrap();
        assert_eq!(theta.dims(), &["chain", "draw", "theta_dim_0"]);
        assert_eq!(theta.shape(), &[2, 3, 2]);
        assert_eq!(
            theta.as_f64().unwrap(),
            &[0., -0., 1., -1., 2., -2., 100., -100., 101., -101., 102., -102.]
        );
        assert_eq!(idata.coords["chain"], vec!["0", "1"]);
        assert_eq!(idata.coords["draw"].len(), 3);
    }

    #[test]
    fn sample_stats_are_typed() {
        let idata = get_idata(&fake_run(2, 3), None, None).unwrap();
        let stats = &idata.sample_stats;
        assert_eq!(stats.variables().len(), 10);
        let diverging = stats.get("diverging").unwrap();
        assert_eq!(diverging.shape(), &[2, 3]);
        let diverging = diverging
            .values()
            .as_any()
            .downcast_ref::<BooleanArray>()
            .unwrap();
        assert_eq!(diverging.true_count(), 2);
        assert!(stats
            .get("n_steps")
            .unwrap()
            .values()
            .as_any()
            .downcast_ref::<UInt64Array>()
            .is_some());
        assert_eq!(stats.get("step_size").unwrap().as_f64().unwrap(), &[0.5; 6]);
    }

    #[test]
    fn custom_dims_and_coords() {
        let dims = Dims::from([("theta".to_string(), vec!["school".to_string()])]);
        let coords = Coords::from([(
            "school".to_string(),
            vec!["a".to_string(), "b".to_string()],
        )]);
        let idata = get_idata(&fake_run(1, 2), Some(&coords), Some(&dims)).unwrap();
        assert_eq!(
            idata.posterior.get("theta").unwrap().dims(),
            &["chain", "draw", "school"]
        );
        assert_eq!(idata.coords["school"], vec!["a", "b"]);

        let bad_coords = Coords::from([("school".to_string(), vec!["a".to_string()])]);
        assert!(matches!(
            get_idata(&fake_run(1, 2), Some(&bad_coords), Some(&dims)),
            Err(IdataError::BadCoords { expected: 2, actual: 1, .. })
        ));

        let bad_dims = Dims::from([("mu".to_string(), vec!["x".to_string()])]);
        assert!(matches!(
            get_idata(&fake_run(1, 2), None, Some(&bad_dims)),
            Err(IdataError::BadDims { expected: 0, actual: 1, .. })
        ));

        let unknown = Dims::from([("sigma".to_string(), vec![])]);
        assert!(matches!(
            get_idata(&fake_run(1, 2), None, Some(&unknown)),
            Err(IdataError::UnknownVariable(_))
        ));
    }

    #[test]
    fn chain_and_draw_coords_can_be_named() {
        let coords = Coords::from([(
            "chain".to_string(),
            vec!["warm".to_string(), "cold".to_string()],
        )]);
        let idata = get_idata(&fake_run(2, 3), Some(&coords), None).unwrap();
        assert_eq!(idata.coords["chain"], vec!["warm", "cold"]);
        assert_eq!(idata.coords["draw"], vec!["0", "1", "2"]);

        let short = Coords::from([("draw".to_string(), vec!["a".to_string()])]);
        assert!(matches!(
            get_idata(&fake_run(2, 3), Some(&short), None),
            Err(IdataError::BadCoords { expected: 3, actual: 1, .. })
        ));
    }

    #[test]
    fn zero_sized_leaves_keep_the_row_count() {
        let mut run = fake_run(2, 3);
        let chains = run
            .chains()
            .iter()
            .cloned()
            .map(|mut chain| {
                for state in chain.states.iter_mut() {
                    if let ParamTree::Map(items) = &mut state.position {
                        items.insert("empty".into(), ParamTree::vector(vec![]));
                    }
                }
                chain
            })
            .collect();
        run = ChainRun::new(chains);

        let idata = get_idata(&run, None, None).unwrap();
        let empty = idata.posterior.get("empty").unwrap();
        assert_eq!(empty.shape(), &[2, 3, 0]);

        let batch = idata.posterior.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 6);
        let column = batch
            .column_by_name("empty")
            .unwrap()
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .unwrap();
        assert_eq!(column.len(), 6);
        assert_eq!(column.value_length(), 0);
    }

    #[test]
    fn empty_run() {
        assert!(matches!(
            get_idata(&ChainRun::new(vec![]), None, None),
            Err(IdataError::EmptyRun)
        ));
    }

    #[test]
    fn record_batch_is_long_format() {
        let idata = get_idata(&fake_run(2, 3), None, None).unwrap();
        let batch = idata.posterior.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 6);
        let names: Vec<_> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        assert_eq!(names, vec!["chain", "draw", "mu", "theta"]);

        let chain = batch
            .column(0)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .unwrap();
        assert_eq!(chain.values().as_ref(), &[0, 0, 0, 1, 1, 1]);

        let theta = batch
            .column(3)
            .as_any()
            .downcast_ref::<FixedSizeListArray>()
            .unwrap();
        assert_eq!(theta.value_length(), 2);
        let row = theta.value(4);
        let row = row.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(row.values().as_ref(), &[101., -101.]);

        let stats = idata.sample_stats.to_record_batch().unwrap();
        assert_eq!(stats.num_columns(), 12);
    }
}
