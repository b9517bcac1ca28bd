pub mod support;

mod engine;
mod web;
