//! # LIS Core
//!
//! 检验仪器集成系统的核心模块，提供基础数据结构、错误定义、外部协作方接口和通用工具。

pub mod error;
pub mod models;
pub mod repository;
pub mod utils;

pub use error::{LisError, Result};
pub use models::*;
pub use repository::{DeviceDirectory, PatientDirectory, ResultStore};
