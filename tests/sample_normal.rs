use std::convert::Infallible;

use nuts_chains::{
    get_idata, jitter_init, run_chains, sample, summarize, warmup, ChainRun, Coords, Dims, Error,
    Key, ParamTree, RunSettings, TreeError,
};
use pretty_assertions::assert_eq;

fn normal_logp(position: &ParamTree, gradient: &mut ParamTree) -> Result<f64, Infallible> {
    let x = position.get("x").and_then(ParamTree::as_scalar).unwrap_or(0.);
    if let Some(grad) = gradient.get_mut("x").and_then(ParamTree::values_mut) {
        grad[0] = -x;
    }
    Ok(-x * x / 2.)
}

/// Independent standard normals over `{loc: scalar, scale: vector(3)}`.
fn nested_logp(position: &ParamTree, gradient: &mut ParamTree) -> Result<f64, Infallible> {
    let mut logp = 0.;
    for name in ["loc", "scale"] {
        let values = position
            .get(name)
            .and_then(ParamTree::as_leaf)
            .map(|leaf| leaf.values().to_vec())
            .unwrap_or_default();
        if let Some(grad) = gradient.get_mut(name).and_then(ParamTree::values_mut) {
            for (g, x) in grad.iter_mut().zip(values.iter()) {
                *g = -x;
            }
        }
        logp -= values.iter().map(|x| x * x / 2.).sum::<f64>();
    }
    Ok(logp)
}

fn scalar_template() -> (ParamTree, ParamTree) {
    (
        ParamTree::map([("x", ParamTree::scalar(0.))]),
        ParamTree::map([("x", ParamTree::scalar(1.))]),
    )
}

fn settings(n_chains: usize, n_warmup: usize, n_samples: usize) -> RunSettings {
    RunSettings {
        n_chains,
        n_warmup,
        n_samples,
        lanes: Some(1),
        ..RunSettings::default()
    }
}

fn positions(run: &ChainRun, chain: usize) -> Vec<ParamTree> {
    run.chains()[chain]
        .states
        .iter()
        .map(|s| s.position.clone())
        .collect()
}

#[test]
fn recovers_standard_normal() -> anyhow::Result<()> {
    let (template, spread) = scalar_template();
    let run = run_chains(
        Key::new(42),
        &normal_logp,
        &template,
        Some(&spread),
        &RunSettings::default(),
    )?;

    assert_eq!(run.n_chains(), 4);
    assert_eq!(run.n_samples(), 500);

    let draws = run.pooled_leaf_values("x").expect("x is a leaf");
    assert_eq!(draws.len(), 2000);
    let n = draws.len() as f64;
    let mean = draws.iter().sum::<f64>() / n;
    let sd = (draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.)).sqrt();
    assert!(mean.abs() < 0.1, "mean {mean}");
    assert!((sd - 1.).abs() < 0.1, "sd {sd}");

    let summary = summarize(&run, "x").expect("x is a leaf");
    assert_eq!(summary.len(), 1);
    assert!((summary[0].r_hat - 1.).abs() < 0.05, "{:?}", summary[0]);
    assert!(run.num_divergences() < 20);
    for chain in run.chains() {
        assert!(chain.tuned.step_size > 0.3 && chain.tuned.step_size < 3.);
    }
    Ok(())
}

#[test]
fn same_seed_same_run() -> anyhow::Result<()> {
    let (template, spread) = scalar_template();
    let settings = settings(2, 50, 20);
    let a = run_chains(Key::new(5), &normal_logp, &template, Some(&spread), &settings)?;
    let b = run_chains(Key::new(5), &normal_logp, &template, Some(&spread), &settings)?;
    let c = run_chains(Key::new(6), &normal_logp, &template, Some(&spread), &settings)?;

    for chain in 0..2 {
        assert_eq!(positions(&a, chain), positions(&b, chain));
        assert_eq!(a.chains()[chain].tuned, b.chains()[chain].tuned);
    }
    assert_ne!(positions(&a, 0), positions(&c, 0));
    assert_ne!(positions(&a, 0), positions(&a, 1));
    Ok(())
}

#[test]
fn chains_only_depend_on_their_keys() -> anyhow::Result<()> {
    let (template, spread) = scalar_template();
    let settings = settings(3, 40, 10);
    let seed = Key::new(11);
    let run = run_chains(seed, &normal_logp, &template, Some(&spread), &settings)?;

    let [sample_key, warmup_key, init_key] = seed.split_array::<3>();
    let chain = 2;
    let start = jitter_init(
        init_key.split(3)[chain],
        &template,
        Some(&spread),
        settings.jitter,
    )?;
    let (state, tuned) = warmup(
        warmup_key.split(3)[chain],
        &start,
        &normal_logp,
        settings.n_warmup,
        &settings.warmup,
    )?;
    let (states, _) = sample(
        sample_key.split(3)[chain],
        &state,
        &tuned,
        &normal_logp,
        settings.n_samples,
    )?;

    assert_eq!(run.chains()[chain].tuned, tuned);
    assert_eq!(run.chains()[chain].states, states);
    Ok(())
}

#[test]
fn parallel_and_sequential_runs_agree() -> anyhow::Result<()> {
    let (template, spread) = scalar_template();
    let sequential = settings(3, 40, 15);
    let parallel = RunSettings {
        lanes: Some(3),
        ..sequential.clone()
    };

    let a = run_chains(Key::new(3), &normal_logp, &template, Some(&spread), &sequential)?;
    let b = run_chains(Key::new(3), &normal_logp, &template, Some(&spread), &parallel)?;
    for chain in 0..3 {
        assert_eq!(a.chains()[chain].chain, b.chains()[chain].chain);
        assert_eq!(a.chains()[chain].states, b.chains()[chain].states);
        assert_eq!(a.chains()[chain].tuned, b.chains()[chain].tuned);
    }
    Ok(())
}

#[test]
fn nested_parameters_keep_their_structure() -> anyhow::Result<()> {
    let template = ParamTree::map([
        ("loc", ParamTree::scalar(0.5)),
        ("scale", ParamTree::vector(vec![0., 1., 2.])),
    ]);
    let run = run_chains(Key::new(1), &nested_logp, &template, None, &settings(2, 60, 25))?;

    for chain in run.chains() {
        assert_eq!(chain.states.len(), 25);
        assert_eq!(chain.tuned.inverse_mass_matrix.len(), 4);
        for state in chain.states.iter() {
            assert_eq!(state.position.treedef(), template.treedef());
            assert_eq!(state.logdensity_grad.treedef(), template.treedef());
            assert!(state.logdensity.is_finite());
        }
    }
    assert_eq!(run.pooled_leaf_values("scale").map(|v| v.len()), Some(2 * 25 * 3));
    Ok(())
}

#[test]
fn without_spread_chains_start_at_the_template() -> anyhow::Result<()> {
    let (template, _) = scalar_template();
    let zero_spread = ParamTree::map([("x", ParamTree::scalar(0.))]);
    for spread in [None, Some(&zero_spread)] {
        let start = jitter_init(Key::new(4), &template, spread, Default::default())?;
        assert_eq!(start, template);
    }
    let run = run_chains(Key::new(4), &normal_logp, &template, None, &settings(2, 20, 5))?;
    assert_eq!(run.n_chains(), 2);
    Ok(())
}

#[test]
fn mismatched_spread_is_an_error() {
    let (template, _) = scalar_template();
    let spread = ParamTree::map([("y", ParamTree::scalar(1.))]);
    let result = run_chains(
        Key::new(0),
        &normal_logp,
        &template,
        Some(&spread),
        &settings(2, 10, 10),
    );
    assert!(matches!(
        result,
        Err(Error::Tree(TreeError::StructureMismatch { .. }))
    ));
}

#[test]
fn inference_data_has_chain_and_draw_dims() -> anyhow::Result<()> {
    let template = ParamTree::map([
        ("loc", ParamTree::scalar(0.)),
        ("scale", ParamTree::vector(vec![0., 0., 0.])),
    ]);
    let run = run_chains(Key::new(8), &nested_logp, &template, None, &settings(2, 30, 12))?;

    let dims = Dims::from([("scale".to_string(), vec!["component".to_string()])]);
    let coords = Coords::from([(
        "component".to_string(),
        vec!["a".to_string(), "b".to_string(), "c".to_string()],
    )]);
    let idata = get_idata(&run, Some(&coords), Some(&dims))?;

    let scale = idata.posterior.get("scale").expect("scale variable");
    assert_eq!(scale.dims(), &["chain", "draw", "component"]);
    assert_eq!(scale.shape(), &[2, 12, 3]);
    assert_eq!(scale.as_f64().map(|v| v.len()), Some(72));
    let loc = idata.posterior.get("loc").expect("loc variable");
    assert_eq!(loc.shape(), &[2, 12]);

    assert_eq!(idata.coords["chain"], vec!["0", "1"]);
    assert_eq!(idata.coords["draw"].len(), 12);
    assert_eq!(idata.coords["component"], vec!["a", "b", "c"]);

    let names: Vec<_> = idata.sample_stats.variables().iter().map(|v| v.name()).collect();
    assert!(names.contains(&"diverging"));
    assert!(names.contains(&"step_size"));
    assert_eq!(idata.sample_stats.n_draws(), 12);

    let batch = idata.posterior.to_record_batch()?;
    assert_eq!(batch.num_rows(), 24);
    assert_eq!(batch.num_columns(), 4);
    Ok(())
}
