mod tests_history;
