use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagRelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Capture error: {details}")]
    Capture { details: String },

    #[error("Detector error: {details}")]
    Detector { details: String },

    #[error("Protocol error: {details}")]
    Protocol { details: String },

    #[error("Device returned exception code {code} for register {register}")]
    DeviceException { code: u8, register: u16 },

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl TagRelayError {
    pub fn capture<S: Into<String>>(details: S) -> Self {
        Self::Capture {
            details: details.into(),
        }
    }

    pub fn detector<S: Into<String>>(details: S) -> Self {
        Self::Detector {
            details: details.into(),
        }
    }

    pub fn protocol<S: Into<String>>(details: S) -> Self {
        Self::Protocol {
            details: details.into(),
        }
    }

    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TagRelayError>;
