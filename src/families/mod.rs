pub mod stacking;
