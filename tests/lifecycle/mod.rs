//! BDD suite for create, mount and teardown against scripted collaborators.

mod bdd_steps;
mod scenarios;
mod test_helpers;
