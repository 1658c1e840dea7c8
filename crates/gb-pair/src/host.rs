//! Host-side inputs: per-type and per-type-pair constants in double precision

use crate::error::{GbError, Result};

/// Interaction form of a type pair; the tag is what kernels read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum PairForm {
    /// Both types are ellipsoids
    #[default]
    EllipseEllipse = 0,
    EllipseSphere = 1,
    SphereSphere = 2,
    SphereEllipse = 3,
}

impl PairForm {
    pub fn tag(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for PairForm {
    type Error = GbError;

    fn try_from(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(PairForm::EllipseEllipse),
            1 => Ok(PairForm::EllipseSphere),
            2 => Ok(PairForm::SphereSphere),
            3 => Ok(PairForm::SphereEllipse),
            other => Err(GbError::InvalidTables(format!("unknown pair form tag {other}"))),
        }
    }
}

/// Dense `n × n` matrix stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct SquareMatrix<T> {
    n: usize,
    data: Vec<T>,
}

impl<T: Clone> SquareMatrix<T> {
    /// Matrix with every entry set to `fill`
    pub fn filled(n: usize, fill: T) -> Self {
        Self {
            n,
            data: vec![fill; n * n],
        }
    }

    /// Matrix with entry `(i, j)` set to `f(i, j)`
    pub fn from_fn(n: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let data = (0..n * n).map(|k| f(k / n, k % n)).collect();
        Self { n, data }
    }

    /// Build from nested rows; every row must have `rows.len()` entries
    pub fn from_rows(rows: Vec<Vec<T>>) -> Result<Self> {
        let n = rows.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != n) {
            return Err(GbError::InvalidTables(format!(
                "row {bad} has {} entries, expected {n}",
                rows[bad].len()
            )));
        }
        Ok(Self {
            n,
            data: rows.into_iter().flatten().collect(),
        })
    }

    /// Set `(i, j)` and `(j, i)` together
    pub fn set_symmetric(&mut self, i: usize, j: usize, value: T) {
        self.data[i * self.n + j] = value.clone();
        self.data[j * self.n + i] = value;
    }
}

impl<T> SquareMatrix<T> {
    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> &T {
        &self.data[i * self.n + j]
    }

    pub fn set(&mut self, i: usize, j: usize, value: T) {
        self.data[i * self.n + j] = value;
    }
}

/// Every constant the potential needs, as the host holds it
///
/// Pair matrices are expected to be symmetric; the builder copies them as given.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTables {
    pub type_count: usize,
    /// Shape semi-axes `(a, b, c)` per type
    pub shape: Vec<[f64; 3]>,
    /// Well-depth semi-axes per type
    pub well: Vec<[f64; 3]>,
    /// Precomputed aspect-ratio scalar per type
    pub lshape: Vec<f64>,
    pub cutsq: SquareMatrix<f64>,
    pub sigma: SquareMatrix<f64>,
    pub epsilon: SquareMatrix<f64>,
    pub form: SquareMatrix<PairForm>,
    pub lj1: SquareMatrix<f64>,
    pub lj2: SquareMatrix<f64>,
    pub lj3: SquareMatrix<f64>,
    pub lj4: SquareMatrix<f64>,
    pub offset: SquareMatrix<f64>,
}

impl HostTables {
    /// Zeroed tables for `type_count` types, every pair uniform-ellipsoid
    pub fn new(type_count: usize) -> Self {
        let zeros = SquareMatrix::filled(type_count, 0.0);
        Self {
            type_count,
            shape: vec![[0.0; 3]; type_count],
            well: vec![[0.0; 3]; type_count],
            lshape: vec![0.0; type_count],
            cutsq: zeros.clone(),
            sigma: zeros.clone(),
            epsilon: zeros.clone(),
            form: SquareMatrix::filled(type_count, PairForm::EllipseEllipse),
            lj1: zeros.clone(),
            lj2: zeros.clone(),
            lj3: zeros.clone(),
            lj4: zeros.clone(),
            offset: zeros,
        }
    }

    /// Check that every table is sized for `type_count`
    pub fn validate(&self) -> Result<()> {
        let n = self.type_count;
        if n == 0 {
            return Err(GbError::InvalidTables("type count must be positive".into()));
        }

        let rows = [("shape", self.shape.len()), ("well", self.well.len()), ("lshape", self.lshape.len())];
        for (name, len) in rows {
            if len != n {
                return Err(GbError::InvalidTables(format!("{name} has {len} rows, expected {n}")));
            }
        }

        let matrices = [
            ("cutsq", self.cutsq.dim()),
            ("sigma", self.sigma.dim()),
            ("epsilon", self.epsilon.dim()),
            ("form", self.form.dim()),
            ("lj1", self.lj1.dim()),
            ("lj2", self.lj2.dim()),
            ("lj3", self.lj3.dim()),
            ("lj4", self.lj4.dim()),
            ("offset", self.offset.dim()),
        ];
        for (name, dim) in matrices {
            if dim != n {
                return Err(GbError::InvalidTables(format!("{name} is {dim}x{dim}, expected {n}x{n}")));
            }
        }
        Ok(())
    }
}
