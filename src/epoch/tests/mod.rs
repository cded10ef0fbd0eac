mod tests_epoch_file;
