// src/service.rs
use crate::decode::{self, DecodeError, ImageFetcher};
use crate::digit_model::{Classifier, ModelError};
use crate::prediction::PredictionResult;
use crate::preprocess;
use image::GrayImage;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub mod digit_recognizer_service {
    tonic::include_proto!("digit_recognizer_service");
    pub(crate) const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("digit_recognizer_descriptor");
}

use digit_recognizer_service::{
    PredictRequest, PredictResponse, digit_recognizer_server::DigitRecognizer,
    predict_request::ImageSource,
};

impl From<DecodeError> for Status {
    fn from(err: DecodeError) -> Self {
        match err {
            // The client's payload was fine; the remote host was not.
            DecodeError::Download(_) => Status::unavailable(err.to_string()),
            _ => Status::invalid_argument(err.to_string()),
        }
    }
}

impl From<ModelError> for Status {
    fn from(err: ModelError) -> Self {
        Status::internal(err.to_string())
    }
}

/// gRPC front for the digit classifier.
#[derive(Clone)]
pub struct DigitRecognizerService {
    classifier: Arc<dyn Classifier>,
    fetcher: ImageFetcher,
}

impl DigitRecognizerService {
    pub fn new(classifier: Arc<dyn Classifier>, fetcher: ImageFetcher) -> Self {
        Self { classifier, fetcher }
    }

    async fn load_image(&self, source: Option<ImageSource>) -> Result<GrayImage, DecodeError> {
        match source.ok_or(DecodeError::MissingSource)? {
            ImageSource::ImageBase64(payload) => decode::decode_base64(&payload),
            ImageSource::ImageData(bytes) => decode::decode_bytes(&bytes),
            ImageSource::ImageUrl(url) => self.fetcher.fetch(&url).await,
        }
    }

    /// Normalises and classifies a canvas off the async executor.
    pub async fn classify_image(&self, image: GrayImage) -> Result<PredictionResult, Status> {
        let classifier = Arc::clone(&self.classifier);
        tokio::task::spawn_blocking(move || -> Result<PredictionResult, ModelError> {
            match preprocess::normalize(&image) {
                Some(tensor) => {
                    let distribution = classifier.classify(&tensor)?;
                    Ok(PredictionResult::from_distribution(&distribution))
                }
                None => Ok(PredictionResult::empty()),
            }
        })
        .await
        .map_err(|err| Status::internal(format!("inference task failed: {err}")))?
        .map_err(Status::from)
    }
}

#[tonic::async_trait]
impl DigitRecognizer for DigitRecognizerService {
    async fn predict(
        &self,
        request: Request<PredictRequest>,
    ) -> Result<Response<PredictResponse>, Status> {
        let PredictRequest { request_id, image_source } = request.into_inner();

        let image = self.load_image(image_source).await.inspect_err(|err| {
            tracing::warn!(%request_id, error = %err, "rejected image");
        })?;
        tracing::debug!(%request_id, width = image.width(), height = image.height(), "image decoded");

        let result = self.classify_image(image).await?;
        if result.is_empty() {
            tracing::debug!(%request_id, "blank canvas");
        } else {
            tracing::info!(%request_id, digit = result.digit, confidence = result.confidence, "classified");
        }

        Ok(Response::new(PredictResponse {
            request_id,
            digit: result.digit,
            confidence: result.confidence,
            empty: result.is_empty(),
            probabilities: result.probabilities,
            model_version: self.classifier.version().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{ok_head, png_bytes, serve_once};
    use crate::digit_model::{ClassDistribution, NUM_CLASSES};
    use crate::preprocess::{FRAME_SIZE, NormalizedTensor};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use image::Luma;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Always answers 4 and counts how often it was asked.
    struct CountingClassifier {
        calls: AtomicUsize,
    }

    impl Classifier for CountingClassifier {
        fn classify(&self, tensor: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(tensor.shape(), &[1, 1, FRAME_SIZE, FRAME_SIZE]);
            let mut logits = [0.0f32; NUM_CLASSES];
            logits[4] = 8.0;
            ClassDistribution::from_logits(&logits)
        }

        fn version(&self) -> &str {
            "stub-v0"
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn classify(&self, _: &NormalizedTensor) -> Result<ClassDistribution, ModelError> {
            Err(ModelError::OutputFormatUnexpected(0))
        }

        fn version(&self) -> &str {
            "broken"
        }
    }

    fn service() -> (DigitRecognizerService, Arc<CountingClassifier>) {
        let classifier = Arc::new(CountingClassifier { calls: AtomicUsize::new(0) });
        (DigitRecognizerService::new(classifier.clone(), fetcher()), classifier)
    }

    fn fetcher() -> ImageFetcher {
        ImageFetcher::new(Duration::from_secs(5), 1 << 20).unwrap()
    }

    fn stroke_png() -> Vec<u8> {
        png_bytes(&GrayImage::from_fn(280, 280, |x, y| {
            Luma([if (130..150).contains(&x) && (40..240).contains(&y) { 255 } else { 0 }])
        }))
    }

    fn request(source: ImageSource) -> Request<PredictRequest> {
        Request::new(PredictRequest {
            request_id: "req-1".to_string(),
            image_source: Some(source),
        })
    }

    #[tokio::test]
    async fn predicts_from_data_url() {
        let (service, classifier) = service();
        let payload = format!("data:image/png;base64,{}", STANDARD.encode(stroke_png()));

        let response = service.predict(request(ImageSource::ImageBase64(payload))).await.unwrap().into_inner();

        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.digit, 4);
        assert!(!response.empty);
        assert_eq!(response.probabilities.len(), NUM_CLASSES);
        assert_eq!(response.confidence, response.probabilities[4]);
        assert_eq!(response.model_version, "stub-v0");
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_canvas_skips_inference() {
        let (service, classifier) = service();
        let blank = png_bytes(&GrayImage::new(280, 280));

        let response = service.predict(request(ImageSource::ImageData(blank))).await.unwrap().into_inner();

        assert_eq!(response.digit, -1);
        assert!(response.empty);
        assert_eq!(response.confidence, 0.0);
        assert_eq!(response.probabilities, vec![0.0; NUM_CLASSES]);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_images_are_client_errors() {
        let (service, _) = service();

        let status = service
            .predict(request(ImageSource::ImageBase64("@@@".to_string())))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .predict(request(ImageSource::ImageData(b"not a png".to_vec())))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .predict(Request::new(PredictRequest { request_id: String::new(), image_source: None }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn predicts_from_url() {
        let (service, classifier) = service();
        let png = stroke_png();
        let url = serve_once(ok_head(png.len()), png, Duration::ZERO).await;

        let response = service.predict(request(ImageSource::ImageUrl(url))).await.unwrap().into_inner();

        assert_eq!(response.digit, 4);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn url_failures_are_not_blamed_on_the_payload() {
        let (service, _) = service();

        // Nothing listens here once the listener is dropped.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let status = service
            .predict(request(ImageSource::ImageUrl(format!("http://{addr}/digit.png"))))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status = service
            .predict(request(ImageSource::ImageUrl("file:///etc/passwd".to_string())))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn model_failures_are_internal_errors() {
        let service = DigitRecognizerService::new(Arc::new(FailingClassifier), fetcher());
        let status = service
            .predict(request(ImageSource::ImageData(stroke_png())))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_classifier() {
        let (service, classifier) = service();
        let png = stroke_png();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let png = png.clone();
                tokio::spawn(async move { service.predict(request(ImageSource::ImageData(png))).await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().into_inner().digit, 4);
        }
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 8);
    }
}
