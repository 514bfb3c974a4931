mod lifecycle;
mod registration;
mod registry;
mod sync;
