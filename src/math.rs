use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Returns `(sum((a + b) * x), sum((a + b) * y))`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y)
        .map(|(a, b, x, y)| ((a + b) * x, (a + b) * y))
        .fold((0f64, 0f64), |(s1, s2), (x, y)| (s1 + x, s2 + y))
}

/// Returns `(sum((a - b + c) * x), sum((a - b + c) * y))`.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(negative1.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y)
        .map(|(a, b, c, x, y)| ((a - b + c) * x, (a - b + c) * y))
        .fold((0f64, 0f64), |(s1, s2), (x, y)| (s1 + x, s2 + y))
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| *out = x * y);
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());

    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a * x + y;
    });
}
