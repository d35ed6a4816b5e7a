use std::fmt::{Debug, Display};

use num::traits::{FromPrimitive, Num, NumAssignOps};

/// Scalar stored in a block.
///
/// Integer elements compare exactly. Floating elements compare within the
/// machine epsilon of their own type. A blocked floating product groups its
/// partial sums per block, so it can differ from a naive loop in the last bits;
/// the epsilon rule absorbs that for well-scaled inputs.
pub trait Element:
    Num + NumAssignOps + FromPrimitive + Copy + Send + Sync + Debug + Display + 'static
{
    /// Returns `true` when `self` and `other` agree under the element's comparison rule.
    fn matches(self, other: Self) -> bool;
}

macro_rules! impl_exact_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                #[inline(always)]
                fn matches(self, other: Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

macro_rules! impl_epsilon_element {
    ($($t:ty),*) => {
        $(
            impl Element for $t {
                #[inline(always)]
                fn matches(self, other: Self) -> bool {
                    (self - other).abs() <= <$t>::EPSILON
                }
            }
        )*
    };
}

impl_exact_element!(i32, i64, u32, u64, usize);
impl_epsilon_element!(f32, f64);
