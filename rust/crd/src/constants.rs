pub const APP_NAME: &str = "spark-k8s";
pub const CONTROLLER_NAME: &str = "sparkapplication";
pub const FIELD_MANAGER_SCOPE: &str = "sparkapplication";

// pod labels
pub const SPARK_ROLE_LABEL: &str = "spark-role";
pub const SPARK_DRIVER_ROLE: &str = "driver";
pub const SPARK_EXECUTOR_ROLE: &str = "executor";
pub const SPARK_EXECUTOR_ID_LABEL: &str = "spark-exec-id";
pub const SPARK_APP_NAME_LABEL: &str = "spark.stackable.tech/app-name";
pub const SPARK_APP_ID_LABEL: &str = "spark.stackable.tech/app-id";

// driver web ui
pub const SPARK_UI_PORT: u16 = 4040;
pub const SPARK_UI_PORT_NAME: &str = "spark-driver-ui-port";
pub const SPARK_UI_SERVICE_SUFFIX: &str = "ui-svc";

// spark-submit configuration keys
pub const SPARK_APP_NAME_CONF: &str = "spark.app.name";
pub const SPARK_NAMESPACE_CONF: &str = "spark.kubernetes.namespace";
pub const SPARK_CONTAINER_IMAGE_CONF: &str = "spark.kubernetes.container.image";
pub const SPARK_DRIVER_IMAGE_CONF: &str = "spark.kubernetes.driver.container.image";
pub const SPARK_EXECUTOR_IMAGE_CONF: &str = "spark.kubernetes.executor.container.image";
pub const SPARK_DRIVER_LABEL_PREFIX: &str = "spark.kubernetes.driver.label.";
pub const SPARK_EXECUTOR_LABEL_PREFIX: &str = "spark.kubernetes.executor.label.";
pub const SPARK_DRIVER_CORES_CONF: &str = "spark.driver.cores";
pub const SPARK_DRIVER_CORE_LIMIT_CONF: &str = "spark.kubernetes.driver.limit.cores";
pub const SPARK_DRIVER_MEMORY_CONF: &str = "spark.driver.memory";
pub const SPARK_DRIVER_SERVICE_ACCOUNT_CONF: &str =
    "spark.kubernetes.authenticate.driver.serviceAccountName";
pub const SPARK_EXECUTOR_INSTANCES_CONF: &str = "spark.executor.instances";
pub const SPARK_EXECUTOR_CORES_CONF: &str = "spark.executor.cores";
pub const SPARK_EXECUTOR_MEMORY_CONF: &str = "spark.executor.memory";
pub const SPARK_JARS_CONF: &str = "spark.jars";
pub const SPARK_FILES_CONF: &str = "spark.files";
pub const SPARK_PY_FILES_CONF: &str = "spark.submit.pyFiles";
pub const SPARK_CONFIG_MAP_CONF: &str = "spark.kubernetes.driver.sparkConfigMap";
pub const HADOOP_CONFIG_MAP_CONF: &str = "spark.kubernetes.hadoop.configMapName";
pub const SPARK_HADOOP_CONF_PREFIX: &str = "spark.hadoop.";
pub const SPARK_WAIT_APP_COMPLETION_CONF: &str = "spark.kubernetes.submission.waitAppCompletion";
