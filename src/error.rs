use thiserror::Error;

pub type Result<T> = std::result::Result<T, OralHealthError>;

#[derive(Debug, Error)]
pub enum OralHealthError {
    /// アップロードが無い、空、または画像としてデコードできない
    #[error("Imagen no válida: {0}")]
    InvalidImage(String),

    #[error("Error al decodificar la imagen: {0}")]
    Decode(String),

    #[error("Formato no soportado: se esperaban 3 canales, se recibieron {channels}")]
    UnsupportedFormat { channels: u8 },

    #[error("Forma de tensor incorrecta: se esperaba {expected:?}, se recibió {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    #[error("No se encontraron muestras en {0}")]
    EmptyDataset(String),

    #[error("{split}: {samples} muestras no alcanzan para un lote de {batch_size}")]
    InsufficientSamples {
        split: String,
        samples: usize,
        batch_size: usize,
    },

    #[error("Error del modelo: {0}")]
    Model(String),

    #[error("Configuración inválida: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OralHealthError {
    /// クライアント入力に起因するエラーかどうか（HTTP 400 に対応）
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImage(_))
    }
}
