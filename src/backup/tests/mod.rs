mod tests_sessions;
