//! Provisioning scenarios and their steps.

mod bdd_steps;
mod scenarios;
