//! Builtin operators.

mod compare;
mod elementwise;
mod fill;
pub mod while_op;

use crate::registry::{OpInfo, OpRegistry};

pub(crate) fn register_builtin_ops(registry: &mut OpRegistry) {
    let add = || {
        OpInfo::kernel(elementwise::add_kernel)
            .with_grad_maker(elementwise::add_grad_maker)
            .with_infer_shape(elementwise::infer_same_as_x)
    };
    registry.register("elementwise_add", add());
    registry.register("add", add());
    registry.register(
        "elementwise_add_grad",
        OpInfo::kernel(elementwise::add_grad_kernel),
    );

    registry.register(
        "elementwise_mul",
        OpInfo::kernel(elementwise::mul_kernel)
            .with_grad_maker(elementwise::mul_grad_maker)
            .with_infer_shape(elementwise::infer_same_as_x),
    );
    registry.register(
        "elementwise_mul_grad",
        OpInfo::kernel(elementwise::mul_grad_kernel),
    );

    registry.register(
        "scale",
        OpInfo::kernel(elementwise::scale_kernel)
            .with_grad_maker(elementwise::scale_grad_maker)
            .with_infer_shape(elementwise::infer_same_as_x),
    );
    registry.register(
        "sum",
        OpInfo::kernel(elementwise::sum_kernel)
            .with_grad_maker(elementwise::sum_grad_maker)
            .with_infer_shape(elementwise::infer_same_as_x),
    );
    registry.register("sum_grad", OpInfo::kernel(elementwise::sum_grad_kernel));
    registry.register(
        "assign",
        OpInfo::kernel(elementwise::assign_kernel)
            .with_grad_maker(elementwise::assign_grad_maker)
            .with_infer_shape(elementwise::infer_same_as_x),
    );

    registry.register(
        "fill_constant",
        OpInfo::kernel(fill::fill_constant_kernel).with_infer_shape(fill::infer_fill_constant),
    );
    registry.register(
        "fill_zeros_like",
        OpInfo::kernel(fill::fill_zeros_like_kernel).with_infer_shape(elementwise::infer_same_as_x),
    );
    registry.register("less_than", OpInfo::kernel(compare::less_than_kernel));
    registry.register("increment", OpInfo::kernel(compare::increment_kernel));

    registry.register(
        "while",
        OpInfo::block(while_op::run_while).with_grad_maker(while_op::while_grad_maker),
    );
    registry.register(
        "while_grad",
        OpInfo::block(while_op::run_while_grad)
            .with_infer_shape(while_op::infer_while_grad_shape)
            .with_infer_var_type(while_op::infer_while_grad_var_type),
    );
}
