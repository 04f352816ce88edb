use std::sync::Arc;

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use self::tiling::{Capacity, CapacityError, TilingConfig, TilingOptimizer};
use crate::loom::{
    device::{Accelerator, DispatchError, Workspace},
    layout::{DataLayout, Shape},
    num::{DataType, Scalar},
    tensor::Tensor,
    tiled::{TileError, TiledTensor},
};

pub mod exec;
pub mod tiling;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation error: {operand} layout is {layout}, expected NHWC")]
    Layout {
        operand: &'static str,
        layout: DataLayout,
    },
    #[error("validation error: {operand} has rank {rank}, expected 4")]
    Rank { operand: &'static str, rank: usize },
    #[error("validation error: {operand} shape {shape} has a zero extent")]
    Empty { operand: &'static str, shape: Shape },
    #[error("validation error: strides must be positive, got ({0}, {1})")]
    Stride(usize, usize),
    #[error("validation error: input holds {input} channels, but weights hold {weights}")]
    Channels { input: usize, weights: usize },
    #[error("validation error: input batch is {input}, but output batch is {output}")]
    Batch { input: usize, output: usize },
    #[error("validation error: output shape is {actual}, expected dims {expected:?}")]
    Output { actual: Shape, expected: [usize; 4] },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config error: {inputs} input channel tiles cannot be matched with {weights} weight channel tiles")]
    Channels { inputs: usize, weights: usize },
    #[error("config error: {operand} grid has rank {rank}, expected 4")]
    Rank { operand: &'static str, rank: usize },
    #[error("config error: {operand} grid holds {count} tiles along dimension {dim}, expected {expected}")]
    Grid {
        operand: &'static str,
        dim: usize,
        count: usize,
        expected: usize,
    },
    #[error(transparent)]
    Tile(#[from] TileError),
}

#[derive(Debug, Error)]
pub enum ConvError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Tile grids of the three convolution operands.
#[derive(Debug, Clone)]
pub struct TiledOperands<T> {
    pub inputs: TiledTensor<T>,
    pub weights: TiledTensor<T>,
    pub outputs: TiledTensor<T>,
}

/// A 2-D convolution with "same" zero padding over NHWC tensors, executed tile by tile.
///
/// Input is `[N, H, W, C]`, weights are `[K, R, S, C]` and the output is
/// `[N, ceil(H / row_stride), ceil(W / col_stride), K]`.
#[derive(Debug, Clone)]
pub struct ConvolutionOp {
    row_stride: usize,
    col_stride: usize,
    capacity: Capacity,
    cache: HashMap<([Shape; 3], DataType), TilingConfig>,
}

impl ConvolutionOp {
    pub fn new(row_stride: usize, col_stride: usize, capacity: Capacity) -> Self {
        Self {
            row_stride,
            col_stride,
            capacity,
            cache: Default::default(),
        }
    }

    #[inline]
    pub fn row_stride(&self) -> usize {
        self.row_stride
    }

    #[inline]
    pub fn col_stride(&self) -> usize {
        self.col_stride
    }

    #[inline]
    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    #[inline]
    pub fn input_layouts(&self) -> &'static [DataLayout] {
        &[DataLayout::NHWC]
    }

    #[inline]
    pub fn output_layouts(&self) -> &'static [DataLayout] {
        &[DataLayout::NHWC]
    }

    /// Dims of the output produced for the given input and weight dims.
    #[inline]
    pub fn output_dims(&self, input: [usize; 4], weights: [usize; 4]) -> [usize; 4] {
        let [n, h, w, _] = input;
        let [k, ..] = weights;
        [n, h.div_ceil(self.row_stride), w.div_ceil(self.col_stride), k]
    }

    pub fn validate(&self, input: &Shape, weights: &Shape, output: &Shape) -> Result<(), ValidationError> {
        if self.row_stride == 0 || self.col_stride == 0 {
            return Err(ValidationError::Stride(self.row_stride, self.col_stride));
        }
        let input_dims = check("input", input)?;
        let weight_dims = check("weights", weights)?;
        let output_dims = check("output", output)?;

        if input_dims[3] != weight_dims[3] {
            return Err(ValidationError::Channels {
                input: input_dims[3],
                weights: weight_dims[3],
            });
        }
        if input_dims[0] != output_dims[0] {
            return Err(ValidationError::Batch {
                input: input_dims[0],
                output: output_dims[0],
            });
        }
        let expected = self.output_dims(input_dims, weight_dims);
        if output_dims != expected {
            return Err(ValidationError::Output {
                actual: output.clone(),
                expected,
            });
        }
        Ok(())
    }

    /// Tile extents for the given operand shapes, computed once per distinct set of shapes.
    pub fn tiling(
        &mut self,
        input: &Shape,
        weights: &Shape,
        output: &Shape,
        data_type: DataType,
    ) -> Result<TilingConfig, ConvError> {
        self.validate(input, weights, output)?;

        let key = ([input.clone(), weights.clone(), output.clone()], data_type);
        if let Some(config) = self.cache.get(&key) {
            return Ok(*config);
        }

        let optimizer = TilingOptimizer::new(self.capacity, self.row_stride, self.col_stride);
        let config = optimizer.compute_basic_tile_shapes(
            check("input", input)?,
            check("weights", weights)?,
            check("output", output)?,
            data_type,
        )?;
        self.cache.insert(key, config);
        Ok(config)
    }

    /// Validates the operands and splits them into tile grids.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn tile<T: Scalar>(
        &mut self,
        input: &Tensor<T>,
        weights: &Tensor<T>,
        output: &Tensor<T>,
    ) -> Result<TiledOperands<T>, ConvError> {
        let config = self.tiling(input.shape(), weights.shape(), output.shape(), T::DATA_TYPE)?;
        let generate = |tensor: &Tensor<T>, extents: [usize; 4], halo: [usize; 4]| {
            TilingOptimizer::generate_tiled_tensor(tensor, &extents, &halo).map_err(ConfigError::from)
        };
        Ok(TiledOperands {
            inputs: generate(input, config.inputs, config.input_halo)?,
            weights: generate(weights, config.weights, [0; 4])?,
            outputs: generate(output, config.outputs, [0; 4])?,
        })
    }

    /// Runs the tile loop over one session and returns the populated output grid.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn execute<T: Scalar>(
        &self,
        accelerator: &Accelerator<T>,
        operands: TiledOperands<T>,
    ) -> Result<TiledTensor<T>, ConvError> {
        let TiledOperands {
            inputs,
            weights,
            outputs,
        } = operands;
        let calls = exec::plan(&inputs, &weights, &outputs, self.row_stride, self.col_stride)?;

        let workspace = Workspace {
            inputs: Arc::new(inputs),
            weights: Arc::new(weights),
            outputs,
        };
        let mut session = accelerator.session(workspace)?;
        for call in calls {
            session.enqueue(call);
        }
        Ok(session.run()?)
    }

    /// Convolves `input` with `weights` into `output`.
    ///
    /// On error, `output` is left untouched.
    pub fn run<T: Scalar>(
        &mut self,
        accelerator: &Accelerator<T>,
        input: &Tensor<T>,
        weights: &Tensor<T>,
        output: &mut Tensor<T>,
    ) -> Result<(), ConvError> {
        let operands = self.tile(input, weights, output)?;
        let outputs = self.execute(accelerator, operands)?;
        *output = outputs.untile();
        Ok(())
    }
}

fn check(operand: &'static str, shape: &Shape) -> Result<[usize; 4], ValidationError> {
    if shape.layout() != DataLayout::NHWC {
        return Err(ValidationError::Layout {
            operand,
            layout: shape.layout(),
        });
    }
    let dims: [usize; 4] = shape.dims().try_into().map_err(|_| ValidationError::Rank {
        operand,
        rank: shape.len(),
    })?;
    if dims.contains(&0) {
        return Err(ValidationError::Empty {
            operand,
            shape: shape.clone(),
        });
    }
    Ok(dims)
}
