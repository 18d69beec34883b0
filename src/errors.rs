use std::fmt::Display;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DelensError
{
    AlmSizeMismatch,
    TransferLengthMismatch,
    SpinNotSupported,
    BandHalfWidthOutOfRange,
    EmptyBand,
    PixelCountMismatch,
    NoiseMapLengthMismatch,
    TemplatesWithFullCovariance,
    SingularTemplateGram,
    NotImplemented,
    ThreadPoolBuildFailed,
    CacheMiss,
    LZ4DecompressionFailed,
    SerializationFailed,
    DeserializationFailed,
    FileIOError,
}
impl std::error::Error for DelensError {}

impl Display for DelensError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", *self)
    }
}
