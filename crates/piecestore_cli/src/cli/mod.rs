use clap::Command;

pub mod args;
pub mod id;
pub mod identity;
pub mod node;
pub mod piece;

pub fn builtin() -> Vec<Command> {
    vec![node::cli(), identity::cli(), id::cli(), piece::cli()]
}
