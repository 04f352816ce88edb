use std::borrow::Cow;

use itertools::Itertools;

use crate::loom::{
    device::{KernelError, TileArgs, TileKernel},
    num::Float,
    tensor::Tensor,
};

/// Software convolution of one tile group, accumulating in `f32`.
///
/// Only the channels held by both the input and the weight tile contribute.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvKernel;

impl<T: Float> TileKernel<T> for ConvKernel {
    fn name(&self) -> Cow<'static, str> {
        Cow::from("cpu-conv")
    }

    fn execute(
        &self,
        args: &TileArgs,
        input: &Tensor<T>,
        weight: &Tensor<T>,
        output: &mut Tensor<T>,
    ) -> Result<(), KernelError> {
        check("input", &args.input_dims, args.input_pad, input)?;
        check("weight", &args.weight_dims, args.weight_pad, weight)?;
        check("output", &args.output_dims, args.output_pad, output)?;

        let [_, input_rows, input_cols, input_channels] = args.input_dims;
        let [filters, kernel_rows, kernel_cols, weight_channels] = args.weight_dims;
        let [batches, rows, cols, channels] = args.output_dims;
        let [sr, sc] = [args.row_stride, args.col_stride];

        let window = |rows: usize, stride: usize, kernel: usize| match rows {
            0 => 0,
            rows => (rows - 1) * stride + kernel,
        };
        if args.input_dims[0] < batches
            || input_rows < window(rows, sr, kernel_rows)
            || input_cols < window(cols, sc, kernel_cols)
        {
            return Err(KernelError::Extent {
                operand: "input",
                actual: args.input_dims,
                output: args.output_dims,
            });
        }
        if filters < channels {
            return Err(KernelError::Extent {
                operand: "weight",
                actual: args.weight_dims,
                output: args.output_dims,
            });
        }

        let input_start = args.input_channel_start;
        let weight_start = args.weight_channel_start;
        let input_end = input_start + input_channels;
        let weight_end = weight_start + weight_channels;
        let start = input_start.max(weight_start);
        let end = input_end.min(weight_end);
        if start >= end {
            return Err(KernelError::Channels {
                input_start,
                input_end,
                weight_start,
                weight_end,
            });
        }

        for (b, y, x, k) in itertools::iproduct!(0..batches, 0..rows, 0..cols, 0..channels) {
            let mut acc = match args.first {
                true => 0.0,
                false => output.get(&[b, y, x, k]).to_f32(),
            };
            for (r, s, c) in itertools::iproduct!(0..kernel_rows, 0..kernel_cols, start..end) {
                let a = input.get(&[b, y * sr + r, x * sc + s, c - input_start]);
                let w = weight.get(&[k, r, s, c - weight_start]);
                acc += a.to_f32() * w.to_f32();
            }
            output.set(&[b, y, x, k], T::from_f32(acc));
        }
        Ok(())
    }
}

fn check<T: Float>(
    operand: &'static str,
    declared: &[usize; 4],
    pad: usize,
    tensor: &Tensor<T>,
) -> Result<(), KernelError> {
    let shape = tensor.shape();
    if shape.dims() != declared || shape.padding(3) != pad {
        return Err(KernelError::Operand {
            operand,
            declared: declared.to_vec(),
            actual: shape.dims().iter().copied().collect_vec(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;

    use super::ConvKernel;
    use crate::loom::{
        device::{KernelError, TileArgs, TileKernel},
        layout::{DataLayout, Shape},
        num::Scalar,
        tensor::Tensor,
    };

    fn make_args(first: bool) -> TileArgs {
        TileArgs {
            input_dims: [1, 3, 3, 2],
            weight_dims: [1, 3, 3, 2],
            output_dims: [1, 1, 1, 1],
            input_pad: 0,
            weight_pad: 0,
            output_pad: 0,
            row_stride: 1,
            col_stride: 1,
            weight_group: 0,
            input_channel_tile: 0,
            input_channel_start: 0,
            weight_channel_start: 0,
            first,
        }
    }

    fn filled<T: Scalar>(dims: [usize; 4], value: T) -> Result<Tensor<T>, Box<dyn Error>> {
        let shape = Shape::new(dims, DataLayout::NHWC);
        let data = vec![value; shape.size()];
        Ok(Tensor::from_logical(shape, data)?)
    }

    #[test]
    fn test_initialize_then_accumulate() -> Result<(), Box<dyn Error>> {
        let input = filled([1, 3, 3, 2], 1.0f32)?;
        let weight = filled([1, 3, 3, 2], 2.0f32)?;
        let mut output = filled([1, 1, 1, 1], 100.0f32)?;

        ConvKernel.execute(&make_args(true), &input, &weight, &mut output)?;
        assert_eq!(output.get(&[0, 0, 0, 0]), 36.0);

        ConvKernel.execute(&make_args(false), &input, &weight, &mut output)?;
        assert_eq!(output.get(&[0, 0, 0, 0]), 72.0);
        Ok(())
    }

    #[test]
    fn test_channel_intersection() -> Result<(), Box<dyn Error>> {
        // input holds channels [0, 2), weight holds channel [1, 2)
        let input = filled([1, 3, 3, 2], f16::ONE)?;
        let weight = filled([1, 3, 3, 1], f16::from_f32(3.0))?;
        let mut output = filled([1, 1, 1, 1], f16::ZERO)?;

        let args = TileArgs {
            weight_dims: [1, 3, 3, 1],
            weight_channel_start: 1,
            ..make_args(true)
        };
        ConvKernel.execute(&args, &input, &weight, &mut output)?;
        assert_eq!(output.get(&[0, 0, 0, 0]), f16::from_f32(27.0));

        let args = TileArgs {
            weight_channel_start: 2,
            ..args
        };
        let err = ConvKernel.execute(&args, &input, &weight, &mut output);
        assert!(matches!(err, Err(KernelError::Channels { .. })));
        Ok(())
    }

    #[test]
    fn test_mismatched_operands() -> Result<(), Box<dyn Error>> {
        let input = filled([1, 3, 3, 2], 1.0f32)?;
        let weight = filled([1, 3, 3, 2], 1.0f32)?;
        let mut output = filled([1, 1, 1, 1], 0.0f32)?;

        let args = TileArgs {
            input_dims: [1, 4, 3, 2],
            ..make_args(true)
        };
        let err = ConvKernel.execute(&args, &input, &weight, &mut output);
        assert!(matches!(err, Err(KernelError::Operand { operand: "input", .. })));

        let args = TileArgs {
            output_dims: [1, 2, 1, 1],
            ..make_args(true)
        };
        let mut output = filled([1, 2, 1, 1], 0.0f32)?;
        let err = ConvKernel.execute(&args, &input, &weight, &mut output);
        assert!(matches!(err, Err(KernelError::Extent { operand: "input", .. })));
        Ok(())
    }
}
