pub mod helpers;
mod tests_compaction_gc;
mod tests_recovery;
