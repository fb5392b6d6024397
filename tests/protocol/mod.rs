//! Wire protocol tests.

mod classifier_test;
