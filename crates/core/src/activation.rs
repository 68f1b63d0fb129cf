//! Feed-forward activation selected by `hidden_act`.

use candle_core::{Error, Result, Tensor};

/// | Name       | Formula |
/// |------------|---------|
/// | `gelu`     | x · Φ(x), exact erf form (original BERT) |
/// | `gelu_new` | tanh approximation of GELU |
/// | `relu`     | max(0, x) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenAct {
    Gelu,
    GeluNew,
    Relu,
}

impl HiddenAct {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gelu" => Ok(Self::Gelu),
            "gelu_new" => Ok(Self::GeluNew),
            "relu" => Ok(Self::Relu),
            other => Err(Error::Msg(format!("unsupported hidden_act {other:?}"))),
        }
    }

    #[inline]
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Gelu => x.gelu_erf(),
            Self::GeluNew => x.gelu(),
            Self::Relu => x.relu(),
        }
    }
}
