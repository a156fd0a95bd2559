//! Domain model for the travel site: entities, pages, and the change
//! dependency tracker seam.

pub mod entities;
pub mod pages;
pub mod tracker;
