//! Values attached to a command-line flag.

/// The value tokens that follow a flag.
///
/// `None` renders no tokens, `One` a single token and `Many` one token per
/// element, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlagValue {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl FlagValue {
    /// Consume the value and return its tokens in order.
    #[must_use]
    pub fn into_tokens(self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }

    /// Returns true if no tokens would be rendered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::One(_) => false,
            Self::Many(values) => values.is_empty(),
        }
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<&String> for FlagValue {
    fn from(value: &String) -> Self {
        Self::One(value.clone())
    }
}

macro_rules! scalar_flag_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for FlagValue {
                fn from(value: $ty) -> Self {
                    Self::One(value.to_string())
                }
            }
        )*
    };
}

scalar_flag_value!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64, char);

impl<T: Into<FlagValue>> From<Option<T>> for FlagValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::None, Into::into)
    }
}

impl<T: ToString> From<Vec<T>> for FlagValue {
    fn from(values: Vec<T>) -> Self {
        Self::Many(values.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString> From<&[T]> for FlagValue {
    fn from(values: &[T]) -> Self {
        Self::Many(values.iter().map(ToString::to_string).collect())
    }
}

impl<T: ToString, const N: usize> From<[T; N]> for FlagValue {
    fn from(values: [T; N]) -> Self {
        Self::Many(values.iter().map(ToString::to_string).collect())
    }
}

impl From<()> for FlagValue {
    fn from((): ()) -> Self {
        Self::None
    }
}
