#[macro_use] extern crate lazy_static;

pub mod errors;
pub mod image;
pub mod install;
pub mod layer;
pub mod manifest;
pub mod opener;
pub mod registry;
pub mod storage;

pub use crate::{
    errors::{Error, ErrorKind},
    install::{Installation, Manager},
    opener::{Opener, OpenerRegistry},
    registry::PullRegistry,
};
